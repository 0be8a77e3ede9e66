//! File-backed flash regions
//!
//! Each region is a file `<dir>/<name>.bin`. Used by the command-line tool
//! and by tests that need flash contents to outlive a process.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{FlashDevice, FlashInfo, FlashProvider};
use crate::error::{FlashError, FlashResult};

/// Default erase block size for file-backed regions
pub const DEFAULT_ERASE_SIZE: u32 = 64 * 1024;

/// Directory of file-backed flash regions
#[derive(Debug, Clone)]
pub struct FileFlashBank {
    dir: PathBuf,
    erase_size: u32,
}

impl FileFlashBank {
    /// Open a bank rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, erase_size: u32) -> Self {
        Self {
            dir: dir.into(),
            erase_size: erase_size.max(1),
        }
    }

    /// Bank directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn region_path(&self, name: &str) -> FlashResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(FlashError::NotFound(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.bin", name)))
    }

    /// Create an erased region of `size` bytes
    pub fn create_partition(&self, name: &str, size: u64) -> FlashResult<()> {
        let path = self.region_path(name)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut file = File::create(&path)?;
        let block = vec![0xFFu8; 64 * 1024];
        let mut remaining = size;
        while remaining > 0 {
            let n = usize::try_from(remaining.min(block.len() as u64)).unwrap_or(block.len());
            file.write_all(block.get(..n).unwrap_or_default())?;
            remaining = remaining.saturating_sub(n as u64);
        }
        file.sync_all()?;
        debug!("Created flash region {} ({} bytes)", path.display(), size);
        Ok(())
    }

    /// Names of the regions present in the bank
    pub fn partitions(&self) -> FlashResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "bin")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl FlashProvider for FileFlashBank {
    fn open(&self, name: &str) -> FlashResult<Box<dyn FlashDevice>> {
        let path = self.region_path(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FlashError::NotFound(name.to_string()),
                _ => FlashError::Io(e),
            })?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileFlashDevice {
            info: FlashInfo {
                name: name.to_string(),
                size,
                erase_size: self.erase_size,
            },
            file,
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.region_path(name).is_ok_and(|path| path.is_file())
    }
}

struct FileFlashDevice {
    info: FlashInfo,
    file: File,
}

impl FlashDevice for FileFlashDevice {
    fn info(&self) -> &FlashInfo {
        &self.info
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FlashResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(buf)
            .map_err(|e| FlashError::ReadFailed {
                offset,
                reason: e.to_string(),
            })
    }

    fn erase_block(&mut self, offset: u64) -> FlashResult<()> {
        let len = u64::from(self.info.erase_size).min(self.info.size.saturating_sub(offset));
        let blank = vec![0xFFu8; usize::try_from(len).unwrap_or_default()];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(&blank)
            .map_err(|e| FlashError::EraseFailed {
                offset,
                reason: e.to_string(),
            })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> FlashResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(data)
            .map_err(|e| FlashError::ProgramFailed {
                offset,
                reason: e.to_string(),
            })?;
        self.file.flush()?;
        Ok(data.len())
    }
}
