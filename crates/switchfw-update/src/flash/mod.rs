//! Flash device handles
//!
//! Firmware regions are addressed by name (the way MTD partitions are) through
//! a [`FlashProvider`]. A [`FlashDevice`] only knows how to unlock, erase,
//! write and read raw blocks; [`FlashHandle`] layers the update discipline on
//! top:
//!
//! - erases run in erase-block strides, unlocking each block first
//! - [`FlashHandle::program`] writes the payload before the header block, so a
//!   crash mid-write leaves a header that fails validation
//! - a device that accepts fewer bytes than requested is an error, never a
//!   silent truncation
//!
//! Handles are opened per operation and closed afterwards; no locking happens
//! here, serialization is the download slot's job.

pub mod file;
pub mod mem;

use tracing::{debug, trace};

use crate::error::{FlashError, FlashResult};

pub use file::{DEFAULT_ERASE_SIZE, FileFlashBank};
pub use mem::{SimFlashBank, SimFlashDevice};

/// Geometry of a flash region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashInfo {
    /// Region name
    pub name: String,
    /// Region size in bytes
    pub size: u64,
    /// Erase block size in bytes
    pub erase_size: u32,
}

/// Raw access to one flash region
pub trait FlashDevice: Send {
    /// Region geometry
    fn info(&self) -> &FlashInfo;

    /// Fill `buf` from `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FlashResult<()>;

    /// Clear write protection on the block at `offset`
    fn unlock_block(&mut self, _offset: u64) -> FlashResult<()> {
        Ok(())
    }

    /// Erase the block at `offset`
    fn erase_block(&mut self, offset: u64) -> FlashResult<()>;

    /// Write `data` at `offset`, returning how many bytes were accepted
    fn write_at(&mut self, offset: u64, data: &[u8]) -> FlashResult<usize>;
}

/// Source of flash regions by name
pub trait FlashProvider: Send + Sync {
    /// Open a region
    fn open(&self, name: &str) -> FlashResult<Box<dyn FlashDevice>>;

    /// Whether a region with this name exists
    fn exists(&self, name: &str) -> bool;
}

/// Round `value` up to a multiple of `align`
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align).saturating_mul(align)
}

/// An open flash region
pub struct FlashHandle {
    device: Box<dyn FlashDevice>,
}

impl std::fmt::Debug for FlashHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashHandle")
            .field("info", self.device.info())
            .finish()
    }
}

impl FlashHandle {
    /// Open `name` through `provider`
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::NotFound`] when the region does not exist.
    pub fn open(provider: &dyn FlashProvider, name: &str) -> FlashResult<Self> {
        let device = provider.open(name)?;
        debug!(
            "Opened flash {} ({} bytes, erase size {})",
            name,
            device.info().size,
            device.info().erase_size
        );
        Ok(Self { device })
    }

    /// Wrap an already-open device
    pub fn from_device(device: Box<dyn FlashDevice>) -> Self {
        Self { device }
    }

    /// Region geometry
    pub fn info(&self) -> &FlashInfo {
        self.device.info()
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.device.info().name
    }

    /// Region size in bytes
    pub fn size(&self) -> u64 {
        self.device.info().size
    }

    /// Erase block size in bytes
    pub fn erase_size(&self) -> u64 {
        u64::from(self.device.info().erase_size.max(1))
    }

    fn check_bounds(&self, offset: u64, length: u64) -> FlashResult<()> {
        let size = self.size();
        match offset.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(FlashError::OutOfBounds {
                offset,
                length,
                size,
            }),
        }
    }

    /// Erase enough blocks from the start of the region to cover `length`
    pub fn erase(&mut self, length: u64) -> FlashResult<()> {
        self.erase_at(0, length)
    }

    /// Erase the blocks covering `[offset, offset + length)`
    pub fn erase_at(&mut self, offset: u64, length: u64) -> FlashResult<()> {
        self.check_bounds(offset, length)?;
        let erase_size = self.erase_size();
        let start = offset.saturating_sub(offset % erase_size);
        let end = align_up(offset.saturating_add(length), erase_size).min(self.size());

        debug!(
            "Erasing {} from {:#x} to {:#x}",
            self.name(),
            start,
            end
        );
        let mut block = start;
        while block < end {
            self.device.unlock_block(block)?;
            self.device.erase_block(block)?;
            trace!("Erased block {:#x} of {}", block, self.name());
            block = block.saturating_add(erase_size);
        }
        Ok(())
    }

    /// Write `data` from the start of the region, payload first and the
    /// header block last
    pub fn program(&mut self, data: &[u8]) -> FlashResult<()> {
        self.check_bounds(0, data.len() as u64)?;
        let header_len = usize::try_from(self.erase_size())
            .unwrap_or(usize::MAX)
            .min(data.len());
        let (header, payload) = data.split_at(header_len);

        if !payload.is_empty() {
            self.write_exact(header_len as u64, payload)?;
        }
        self.write_exact(0, header)?;
        debug!("Programmed {} bytes to {}", data.len(), self.name());
        Ok(())
    }

    /// Write `data` at `offset` in a single positioned write
    pub fn program_at(&mut self, data: &[u8], offset: u64) -> FlashResult<()> {
        self.check_bounds(offset, data.len() as u64)?;
        self.write_exact(offset, data)
    }

    fn write_exact(&mut self, offset: u64, data: &[u8]) -> FlashResult<()> {
        trace!(
            "Writing {} bytes at {:#x} of {}",
            data.len(),
            offset,
            self.name()
        );
        let written = self.device.write_at(offset, data)?;
        if written != data.len() {
            return Err(FlashError::ShortWrite {
                offset,
                expected: data.len(),
                written,
            });
        }
        Ok(())
    }

    /// Fill `buf` from `offset`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FlashResult<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        self.device.read_at(offset, buf)
    }

    /// Read `length` bytes from `offset`
    pub fn read_vec(&mut self, offset: u64, length: usize) -> FlashResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Whether the start of the region already holds exactly `data`
    pub fn checksame(&mut self, data: &[u8]) -> FlashResult<bool> {
        if data.len() as u64 > self.size() {
            return Ok(false);
        }
        const CHUNK: usize = 64 * 1024;
        let mut buf = vec![0u8; CHUNK.min(data.len())];
        let mut offset = 0usize;
        for expected in data.chunks(CHUNK) {
            let current = buf.get_mut(..expected.len()).unwrap_or_default();
            self.device.read_at(offset as u64, current)?;
            if *current != *expected {
                return Ok(false);
            }
            offset = offset.saturating_add(expected.len());
        }
        Ok(true)
    }

    /// Close the handle
    pub fn close(self) {
        trace!("Closed flash {}", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(17, 0), 17);
    }

    #[test]
    fn test_program_writes_header_block_last() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("linux", 4 * 1024, 1024);
        let mut handle = FlashHandle::open(&bank, "linux")?;

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        handle.erase(data.len() as u64)?;
        handle.program(&data)?;

        let log = bank.write_log("linux");
        assert_eq!(log, vec![(1024, 1976), (0, 1024)]);
        assert!(handle.checksame(&data)?);
        Ok(())
    }

    #[test]
    fn test_out_of_bounds_rejected() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("small", 2048, 1024);
        let mut handle = FlashHandle::open(&bank, "small")?;
        assert!(matches!(
            handle.program(&[0u8; 4096]),
            Err(FlashError::OutOfBounds { .. })
        ));
        assert!(matches!(
            handle.program_at(&[0u8; 16], u64::MAX),
            Err(FlashError::OutOfBounds { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_missing_region() {
        let bank = SimFlashBank::new();
        assert!(matches!(
            FlashHandle::open(&bank, "nope"),
            Err(FlashError::NotFound(_))
        ));
    }
}
