//! In-memory simulated NOR flash
//!
//! Behaves like NOR: erase sets every byte of a block to `0xFF`, program can
//! only clear bits (the new byte is ANDed into the old one). Erase and write
//! faults can be scheduled to simulate power loss at a precise step.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{FlashDevice, FlashInfo, FlashProvider};
use crate::error::{FlashError, FlashResult};

#[derive(Debug)]
struct SimRegion {
    info: FlashInfo,
    data: Vec<u8>,
    write_log: Vec<(u64, usize)>,
    erase_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFault {
    Fail,
    Truncate,
}

#[derive(Debug, Default)]
struct Faults {
    erase_countdown: Option<usize>,
    write_countdown: Option<(usize, WriteFault)>,
}

fn countdown(counter: &mut Option<usize>) -> bool {
    match counter {
        Some(n) if *n <= 1 => {
            *counter = None;
            true
        }
        Some(n) => {
            *n = n.saturating_sub(1);
            false
        }
        None => false,
    }
}

#[derive(Debug, Default)]
struct BankInner {
    regions: HashMap<String, Arc<Mutex<SimRegion>>>,
    faults: Faults,
}

/// A bank of named simulated flash regions
///
/// Clones share the same regions, so a test can keep one clone for
/// inspection while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct SimFlashBank {
    inner: Arc<Mutex<BankInner>>,
}

impl SimFlashBank {
    /// Create an empty bank
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an erased region, replacing any region with the same name
    pub fn add_partition(&self, name: &str, size: u64, erase_size: u32) {
        let len = usize::try_from(size).unwrap_or(usize::MAX);
        let region = SimRegion {
            info: FlashInfo {
                name: name.to_string(),
                size,
                erase_size,
            },
            data: vec![0xFF; len],
            write_log: Vec::new(),
            erase_count: 0,
        };
        self.inner
            .lock()
            .regions
            .insert(name.to_string(), Arc::new(Mutex::new(region)));
    }

    fn region(&self, name: &str) -> Option<Arc<Mutex<SimRegion>>> {
        self.inner.lock().regions.get(name).cloned()
    }

    /// Overwrite region bytes directly, bypassing NOR rules and fault
    /// injection
    pub fn load(&self, name: &str, offset: usize, bytes: &[u8]) -> FlashResult<()> {
        let region = self
            .region(name)
            .ok_or_else(|| FlashError::NotFound(name.to_string()))?;
        let mut region = region.lock();
        let size = region.info.size;
        let end = offset.saturating_add(bytes.len());
        let target = region
            .data
            .get_mut(offset..end)
            .ok_or(FlashError::OutOfBounds {
                offset: offset as u64,
                length: bytes.len() as u64,
                size,
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Snapshot of a region's contents
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.region(name).map(|r| r.lock().data.clone())
    }

    /// Writes issued to a region as `(offset, length)` pairs, oldest first
    pub fn write_log(&self, name: &str) -> Vec<(u64, usize)> {
        self.region(name)
            .map(|r| r.lock().write_log.clone())
            .unwrap_or_default()
    }

    /// Number of block erases issued to a region
    pub fn erase_count(&self, name: &str) -> usize {
        self.region(name).map_or(0, |r| r.lock().erase_count)
    }

    /// Reset write logs and erase counters of every region
    pub fn clear_logs(&self) {
        for region in self.inner.lock().regions.values() {
            let mut region = region.lock();
            region.write_log.clear();
            region.erase_count = 0;
        }
    }

    /// Make the `n`th block erase from now fail (1 = the next one)
    pub fn fail_nth_erase(&self, n: usize) {
        self.inner.lock().faults.erase_countdown = Some(n);
    }

    /// Make the `n`th write from now fail without touching the flash
    pub fn fail_nth_write(&self, n: usize) {
        self.inner.lock().faults.write_countdown = Some((n, WriteFault::Fail));
    }

    /// Make the `n`th write from now accept only half of its bytes
    pub fn truncate_nth_write(&self, n: usize) {
        self.inner.lock().faults.write_countdown = Some((n, WriteFault::Truncate));
    }

    /// Cancel scheduled faults
    pub fn clear_faults(&self) {
        self.inner.lock().faults = Faults::default();
    }

    fn trip_erase(&self) -> bool {
        countdown(&mut self.inner.lock().faults.erase_countdown)
    }

    fn trip_write(&self) -> Option<WriteFault> {
        let mut inner = self.inner.lock();
        let (remaining, fault) = inner.faults.write_countdown?;
        if remaining <= 1 {
            inner.faults.write_countdown = None;
            Some(fault)
        } else {
            inner.faults.write_countdown = Some((remaining.saturating_sub(1), fault));
            None
        }
    }
}

impl FlashProvider for SimFlashBank {
    fn open(&self, name: &str) -> FlashResult<Box<dyn FlashDevice>> {
        let region = self
            .region(name)
            .ok_or_else(|| FlashError::NotFound(name.to_string()))?;
        let info = region.lock().info.clone();
        Ok(Box::new(SimFlashDevice {
            info,
            region,
            bank: self.clone(),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.lock().regions.contains_key(name)
    }
}

/// Open handle onto a simulated region
#[derive(Debug)]
pub struct SimFlashDevice {
    info: FlashInfo,
    region: Arc<Mutex<SimRegion>>,
    bank: SimFlashBank,
}

impl SimFlashDevice {
    fn span(&self, offset: u64, len: usize) -> FlashResult<std::ops::Range<usize>> {
        let out_of_bounds = || FlashError::OutOfBounds {
            offset,
            length: len as u64,
            size: self.info.size,
        };
        let start = usize::try_from(offset).map_err(|e| FlashError::ReadFailed {
            offset,
            reason: e.to_string(),
        })?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end as u64 > self.info.size {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}

impl FlashDevice for SimFlashDevice {
    fn info(&self) -> &FlashInfo {
        &self.info
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FlashResult<()> {
        let span = self.span(offset, buf.len())?;
        let region = self.region.lock();
        let src = region.data.get(span).ok_or(FlashError::ReadFailed {
            offset,
            reason: "region shorter than its geometry".to_string(),
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn erase_block(&mut self, offset: u64) -> FlashResult<()> {
        if self.bank.trip_erase() {
            debug!("Injected erase fault at {:#x} of {}", offset, self.info.name);
            return Err(FlashError::EraseFailed {
                offset,
                reason: "injected fault".to_string(),
            });
        }
        let erase_size = usize::try_from(self.info.erase_size.max(1)).unwrap_or(1);
        let span = self.span(offset, erase_size)?;
        let mut region = self.region.lock();
        if let Some(block) = region.data.get_mut(span) {
            block.fill(0xFF);
        }
        region.erase_count = region.erase_count.saturating_add(1);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> FlashResult<usize> {
        let accepted = match self.bank.trip_write() {
            Some(WriteFault::Fail) => {
                debug!("Injected write fault at {:#x} of {}", offset, self.info.name);
                return Err(FlashError::ProgramFailed {
                    offset,
                    reason: "injected fault".to_string(),
                });
            }
            Some(WriteFault::Truncate) => data.len() / 2,
            None => data.len(),
        };
        let data = data.get(..accepted).unwrap_or_default();
        let span = self.span(offset, data.len())?;
        let mut region = self.region.lock();
        region.write_log.push((offset, data.len()));
        if let Some(target) = region.data.get_mut(span) {
            for (cell, byte) in target.iter_mut().zip(data) {
                *cell &= *byte;
            }
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FlashHandle;

    #[test]
    fn test_program_only_clears_bits() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("p", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "p")?;

        handle.program_at(&[0xF0], 0)?;
        handle.program_at(&[0x3C], 0)?;
        assert_eq!(handle.read_vec(0, 1)?, vec![0x30]);

        handle.erase(1)?;
        assert_eq!(handle.read_vec(0, 1)?, vec![0xFF]);
        Ok(())
    }

    #[test]
    fn test_scheduled_write_fault_fires_once() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("p", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "p")?;

        bank.fail_nth_write(2);
        handle.program_at(&[1], 0)?;
        assert!(matches!(
            handle.program_at(&[2], 1),
            Err(FlashError::ProgramFailed { .. })
        ));
        handle.program_at(&[3], 2)?;
        assert_eq!(bank.write_log("p"), vec![(0, 1), (2, 1)]);
        Ok(())
    }

    #[test]
    fn test_truncated_write_is_short_write() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("p", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "p")?;

        bank.truncate_nth_write(1);
        assert!(matches!(
            handle.program_at(&[0u8; 8], 0),
            Err(FlashError::ShortWrite {
                expected: 8,
                written: 4,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_erase_fault() -> FlashResult<()> {
        let bank = SimFlashBank::new();
        bank.add_partition("p", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "p")?;

        bank.fail_nth_erase(3);
        assert!(matches!(
            handle.erase(1024),
            Err(FlashError::EraseFailed { offset: 512, .. })
        ));
        assert_eq!(bank.erase_count("p"), 2);
        Ok(())
    }
}
