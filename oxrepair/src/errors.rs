// SPDX-License-Identifier: MIT

use core::fmt;

pub use oxio::errors::{OxIoError, OxIoResult};

/// Result type for scan operations.
pub type ScanResult<T = ()> = core::result::Result<T, ScanError>;

/// Hard failures that end processing of the current allocation group.
///
/// Everything softer than this (bad checksums, structural violations,
/// count mismatches) is data, not an error: it flows out through the
/// finding report instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    IO(OxIoError),
    ReadBlock { agno: u32, agbno: u32 },
    Superblock(&'static str),
}

impl ScanError {
    pub fn msg(&self) -> &'static str {
        match self {
            ScanError::IO(_) => "IO error",
            ScanError::ReadBlock { .. } => "Unreadable block",
            ScanError::Superblock(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<OxIoError> {
        match self {
            ScanError::IO(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<OxIoError> for ScanError {
    #[inline]
    fn from(e: OxIoError) -> Self {
        ScanError::IO(e)
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        if let ScanError::ReadBlock { agno, agbno } = self {
            write!(f, " ({agno}/{agbno})")?;
        }
        if let Some(src) = self.source() {
            write!(f, "\n  caused by: {}", src.msg())?;
        }
        Ok(())
    }
}
