// SPDX-License-Identifier: MIT

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::errors::OxIoResult;
use crate::OxIo;

/// File-backed implementation of `OxIo`.
///
/// Uses positional `pread`/`pwrite`, which are thread-safe on a shared
/// descriptor and need no seek state.
#[derive(Debug)]
pub struct FileOxIo {
    file: File,
    len: u64,
}

impl FileOxIo {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn open_readonly(path: &std::path::Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl OxIo for FileOxIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> OxIoResult {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> OxIoResult {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn flush(&self) -> OxIoResult {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }
}
