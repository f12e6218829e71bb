// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for block device operations.
pub type OxIoResult<T = ()> = core::result::Result<T, OxIoError>;

/// Error type for block device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OxIoError {
    Other(&'static str),
    OutOfBounds,
    Unsupported,
}

impl OxIoError {
    pub fn msg(&self) -> &'static str {
        match self {
            OxIoError::Other(msg) => msg,
            OxIoError::OutOfBounds => "Out of bounds",
            OxIoError::Unsupported => "Unsupported operation",
        }
    }
}

impl From<&'static str> for OxIoError {
    #[inline]
    fn from(msg: &'static str) -> Self {
        OxIoError::Other(msg)
    }
}

impl From<std::io::Error> for OxIoError {
    #[cold]
    #[inline(never)]
    fn from(e: std::io::Error) -> Self {
        // Leak the string to produce a 'static str. Acceptable for error mapping.
        let leaked: &'static str = Box::leak(e.to_string().into_boxed_str());
        OxIoError::Other(leaked)
    }
}

impl fmt::Display for OxIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        Ok(())
    }
}
