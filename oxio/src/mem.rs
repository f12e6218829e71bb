// SPDX-License-Identifier: MIT

use parking_lot::Mutex;

use crate::errors::{OxIoError, OxIoResult};
use crate::OxIo;

/// In-memory implementation of `OxIo`.
///
/// Useful for tests, RAM-backed images, virtual disks. The buffer sits
/// behind a mutex so a single device can serve concurrent readers.
#[derive(Debug)]
pub struct MemOxIo {
    buffer: Mutex<Vec<u8>>,
    len: u64,
}

impl MemOxIo {
    /// Creates a zero-filled device of `len` bytes.
    pub fn new(len: u64) -> Self {
        Self {
            buffer: Mutex::new(vec![0u8; len as usize]),
            len,
        }
    }

    /// Wraps an existing image buffer.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        let len = buffer.len() as u64;
        Self {
            buffer: Mutex::new(buffer),
            len,
        }
    }

    /// Returns a copy of the full device contents.
    ///
    /// Handy for before/after comparisons in tests.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    #[inline]
    fn check_bounds(&self, offset: u64, len: usize) -> OxIoResult {
        let end = offset
            .checked_add(len as u64)
            .ok_or(OxIoError::OutOfBounds)?;
        if end > self.len {
            return Err(OxIoError::OutOfBounds);
        }
        Ok(())
    }
}

impl OxIo for MemOxIo {
    #[inline]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> OxIoResult {
        self.check_bounds(offset, buf.len())?;
        let src = self.buffer.lock();
        buf.copy_from_slice(&src[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    #[inline]
    fn write_at(&self, offset: u64, data: &[u8]) -> OxIoResult {
        self.check_bounds(offset, data.len())?;
        let mut dst = self.buffer.lock();
        dst[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    #[inline]
    fn flush(&self) -> OxIoResult {
        Ok(())
    }

    #[inline]
    fn size(&self) -> u64 {
        self.len
    }
}
