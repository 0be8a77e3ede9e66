//! Redundant partition descriptor tables
//!
//! The boot loader keeps its partition directory twice, in two flash regions.
//! Slot 0 of each copy is not a partition: its name bytes hold a validity
//! record
//!
//! ```text
//! ".FisValid\0" | valid_flag[2] | version_count: u32
//! ```
//!
//! The valid copy with the higher version is authoritative. Changes are
//! committed to the other copy in two phases so that a crash never leaves a
//! half-written table marked valid:
//!
//! 1. bump the version of the in-memory copy
//! 2. erase the alternate region
//! 3. write the whole table with the flags set to in-progress
//! 4. rewrite only the two flag bytes as valid
//!
//! Each flag state only clears bits relative to the previous one, so step 4
//! is a plain NOR program without an erase.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::error::{FirmwareError, FirmwareResult};
use crate::flash::{FlashHandle, FlashProvider};
use crate::tlv::{le_u32, put_le_u32};

/// Size of one descriptor record
pub const FIS_ENTRY_SIZE: usize = 256;
/// Size of the name field
pub const FIS_NAME_SIZE: usize = 16;
/// Validity magic stored in slot 0
pub const FIS_VALID_MAGIC: &[u8; 10] = b".FisValid\0";
/// Offset of the validity flags within the table
pub const FIS_FLAGS_OFFSET: usize = 10;
/// Offset of the version counter within the table
pub const FIS_VERSION_OFFSET: usize = 12;
/// Table is complete and usable
pub const FIS_FLAG_VALID: u8 = 0xA5;
/// Table is being written
pub const FIS_FLAG_IN_PROGRESS: u8 = 0xFD;
/// Table region is erased
pub const FIS_FLAG_EMPTY: u8 = 0xFF;

const PADDING_OFFSET: usize = 36;
const PADDING_SIZE: usize = 212;
const DESC_CKSUM_OFFSET: usize = 248;
const FILE_CKSUM_OFFSET: usize = 252;

/// One partition descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FisDescriptor {
    /// Raw NUL-padded name; slot 0 overlays the validity record here
    pub name: [u8; FIS_NAME_SIZE],
    /// Offset of the partition in flash
    pub flash_base: u32,
    /// Load address
    pub mem_base: u32,
    /// Partition size
    pub size: u32,
    /// Entry point
    pub entry_point: u32,
    /// Length of the data stored in the partition
    pub data_length: u32,
    /// Reserved bytes, preserved as read
    pub padding: Vec<u8>,
    /// Descriptor checksum, preserved as read
    pub desc_cksum: u32,
    /// File checksum, preserved as read
    pub file_cksum: u32,
}

impl Default for FisDescriptor {
    fn default() -> Self {
        Self::erased()
    }
}

impl FisDescriptor {
    /// An erased (unused) slot
    pub fn erased() -> Self {
        Self {
            name: [0xFF; FIS_NAME_SIZE],
            flash_base: u32::MAX,
            mem_base: u32::MAX,
            size: u32::MAX,
            entry_point: u32::MAX,
            data_length: u32::MAX,
            padding: vec![0xFF; PADDING_SIZE],
            desc_cksum: u32::MAX,
            file_cksum: u32::MAX,
        }
    }

    /// A partition entry
    pub fn new(name: &str, flash_base: u32, size: u32) -> Self {
        let mut desc = Self {
            name: [0; FIS_NAME_SIZE],
            flash_base,
            mem_base: 0,
            size,
            entry_point: 0,
            data_length: 0,
            padding: vec![0; PADDING_SIZE],
            desc_cksum: 0,
            file_cksum: 0,
        };
        desc.set_name(name);
        desc
    }

    /// Decode a 256-byte record
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let record = buf.get(..FIS_ENTRY_SIZE)?;
        Some(Self {
            name: record.get(..FIS_NAME_SIZE)?.try_into().ok()?,
            flash_base: le_u32(record, 16)?,
            mem_base: le_u32(record, 20)?,
            size: le_u32(record, 24)?,
            entry_point: le_u32(record, 28)?,
            data_length: le_u32(record, 32)?,
            padding: record
                .get(PADDING_OFFSET..PADDING_OFFSET + PADDING_SIZE)?
                .to_vec(),
            desc_cksum: le_u32(record, DESC_CKSUM_OFFSET)?,
            file_cksum: le_u32(record, FILE_CKSUM_OFFSET)?,
        })
    }

    /// Encode as a 256-byte record
    pub fn encode(&self) -> [u8; FIS_ENTRY_SIZE] {
        let mut out = [0u8; FIS_ENTRY_SIZE];
        if let Some(dst) = out.get_mut(..FIS_NAME_SIZE) {
            dst.copy_from_slice(&self.name);
        }
        for (offset, value) in [
            (16, self.flash_base),
            (20, self.mem_base),
            (24, self.size),
            (28, self.entry_point),
            (32, self.data_length),
            (DESC_CKSUM_OFFSET, self.desc_cksum),
            (FILE_CKSUM_OFFSET, self.file_cksum),
        ] {
            put_le_u32(&mut out, offset, value);
        }
        if let Some(dst) = out.get_mut(PADDING_OFFSET..PADDING_OFFSET + PADDING_SIZE) {
            let len = self.padding.len().min(PADDING_SIZE);
            if let (Some(dst), Some(src)) = (dst.get_mut(..len), self.padding.get(..len)) {
                dst.copy_from_slice(src);
            }
        }
        out
    }

    /// Whether the slot holds a partition; erased and cleared slots do not
    pub fn is_valid_entry(&self) -> bool {
        !matches!(self.name.first(), None | Some(0x00) | Some(0xFF))
    }

    /// Name as a string
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(FIS_NAME_SIZE);
        String::from_utf8_lossy(self.name.get(..end).unwrap_or_default()).into_owned()
    }

    /// Replace the name, truncating to leave a terminator
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; FIS_NAME_SIZE];
        let len = name.len().min(FIS_NAME_SIZE - 1);
        if let (Some(dst), Some(src)) = (self.name.get_mut(..len), name.as_bytes().get(..len)) {
            dst.copy_from_slice(src);
        }
    }
}

/// Validity record decoded from slot 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableValidity {
    /// The two flag bytes
    pub flags: [u8; 2],
    /// Version counter
    pub version: u32,
}

impl TableValidity {
    /// Whether the table may be used
    pub fn is_valid(&self) -> bool {
        self.flags.first() == Some(&FIS_FLAG_VALID)
    }
}

/// In-memory copy of one descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FisTable {
    slots: Vec<FisDescriptor>,
}

impl FisTable {
    /// Decode every whole record of `buf`
    pub fn parse(buf: &[u8]) -> Self {
        let slots = buf
            .chunks_exact(FIS_ENTRY_SIZE)
            .filter_map(FisDescriptor::parse)
            .collect();
        Self { slots }
    }

    /// A fresh, valid table of `slot_count` slots holding `entries`
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::TableFull`] when the entries do not fit.
    pub fn with_entries(slot_count: usize, entries: &[FisDescriptor]) -> FirmwareResult<Self> {
        if entries.len() >= slot_count {
            return Err(FirmwareError::TableFull);
        }
        let mut slots = vec![FisDescriptor::erased(); slot_count];
        for (slot, entry) in slots.iter_mut().skip(1).zip(entries) {
            *slot = entry.clone();
        }
        let mut table = Self { slots };
        table.set_validity(TableValidity {
            flags: [FIS_FLAG_VALID; 2],
            version: 1,
        });
        Ok(table)
    }

    /// Encode every slot
    pub fn encode(&self) -> Vec<u8> {
        self.slots.iter().flat_map(FisDescriptor::encode).collect()
    }

    /// Number of slots including the validity slot
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Validity record, `None` when the magic is absent
    pub fn validity(&self) -> Option<TableValidity> {
        let name = &self.slots.first()?.name;
        if name.get(..FIS_VALID_MAGIC.len())? != FIS_VALID_MAGIC {
            return None;
        }
        Some(TableValidity {
            flags: name
                .get(FIS_FLAGS_OFFSET..FIS_FLAGS_OFFSET + 2)?
                .try_into()
                .ok()?,
            version: le_u32(name, FIS_VERSION_OFFSET)?,
        })
    }

    /// Whether the table carries the magic and a valid flag
    pub fn is_valid(&self) -> bool {
        self.validity().is_some_and(|v| v.is_valid())
    }

    /// Version counter, 0 when the validity record is missing
    pub fn version(&self) -> u32 {
        self.validity().map_or(0, |v| v.version)
    }

    /// Overwrite the validity record
    pub fn set_validity(&mut self, validity: TableValidity) {
        if let Some(slot) = self.slots.first_mut() {
            if let Some(dst) = slot.name.get_mut(..FIS_VALID_MAGIC.len()) {
                dst.copy_from_slice(FIS_VALID_MAGIC);
            }
            if let Some(dst) = slot.name.get_mut(FIS_FLAGS_OFFSET..FIS_FLAGS_OFFSET + 2) {
                dst.copy_from_slice(&validity.flags);
            }
            put_le_u32(&mut slot.name, FIS_VERSION_OFFSET, validity.version);
        }
    }

    fn set_flags(&mut self, flag: u8) {
        let version = self.version();
        self.set_validity(TableValidity {
            flags: [flag; 2],
            version,
        });
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, desc)| desc.is_valid_entry() && desc.name() == name)
            .map(|(i, _)| i)
    }

    /// Descriptor of partition `name`
    pub fn find(&self, name: &str) -> Option<&FisDescriptor> {
        self.position(name).and_then(|i| self.slots.get(i))
    }

    /// Mutable descriptor of partition `name`
    pub fn find_mut(&mut self, name: &str) -> Option<&mut FisDescriptor> {
        self.position(name).and_then(|i| self.slots.get_mut(i))
    }

    /// Insert `entry` in the slot of `existing`, shifting later slots down
    ///
    /// # Errors
    ///
    /// Returns `PartitionNotFound` when `existing` is absent and `TableFull`
    /// when the last slot is in use.
    pub fn insert_before(&mut self, existing: &str, entry: FisDescriptor) -> FirmwareResult<()> {
        let index = self
            .position(existing)
            .ok_or_else(|| FirmwareError::PartitionNotFound(existing.to_string()))?;
        if self.slots.last().is_none_or(FisDescriptor::is_valid_entry) {
            return Err(FirmwareError::TableFull);
        }
        self.slots.pop();
        self.slots.insert(index, entry);
        Ok(())
    }

    /// Partition entries in slot order
    pub fn entries(&self) -> impl Iterator<Item = &FisDescriptor> {
        self.slots.iter().skip(1).filter(|d| d.is_valid_entry())
    }
}

/// The authoritative table and where each copy lives
#[derive(Debug, Clone)]
pub struct ActiveTable {
    /// Authoritative copy
    pub table: FisTable,
    /// Region holding the authoritative copy
    pub active: String,
    /// Region the next commit writes to
    pub alternate: String,
}

/// Reads and commits the redundant table pair
#[derive(Clone)]
pub struct FisManager {
    provider: Arc<dyn FlashProvider>,
    primary: String,
    redundant: String,
}

impl std::fmt::Debug for FisManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FisManager")
            .field("primary", &self.primary)
            .field("redundant", &self.redundant)
            .finish_non_exhaustive()
    }
}

impl FisManager {
    /// Manage the tables stored in regions `primary` and `redundant`
    pub fn new(
        provider: Arc<dyn FlashProvider>,
        primary: impl Into<String>,
        redundant: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            primary: primary.into(),
            redundant: redundant.into(),
        }
    }

    fn load(&self, name: &str) -> FirmwareResult<FisTable> {
        let mut handle = FlashHandle::open(self.provider.as_ref(), name)?;
        let size = usize::try_from(handle.size()).unwrap_or(usize::MAX);
        let data = handle.read_vec(0, size)?;
        handle.close();
        Ok(FisTable::parse(&data))
    }

    /// Load both copies and pick the authoritative one
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::NoValidTable`] when neither copy is valid.
    pub fn read(&self) -> FirmwareResult<ActiveTable> {
        let primary = self.load(&self.primary)?;
        let redundant = self.load(&self.redundant)?;

        let primary_active = match (primary.validity(), redundant.validity()) {
            (Some(p), Some(r)) if p.is_valid() && r.is_valid() => {
                debug!(
                    "Both tables valid ({}: {}, {}: {})",
                    self.primary, p.version, self.redundant, r.version
                );
                p.version > r.version
            }
            (Some(p), _) if p.is_valid() => true,
            (_, Some(r)) if r.is_valid() => false,
            _ => {
                warn!("Neither {} nor {} is valid", self.primary, self.redundant);
                return Err(FirmwareError::NoValidTable);
            }
        };

        let active = if primary_active {
            ActiveTable {
                table: primary,
                active: self.primary.clone(),
                alternate: self.redundant.clone(),
            }
        } else {
            ActiveTable {
                table: redundant,
                active: self.redundant.clone(),
                alternate: self.primary.clone(),
            }
        };
        debug!(
            "Active table {} (version {})",
            active.active,
            active.table.version()
        );
        Ok(active)
    }

    /// Write `current.table` to the alternate region and make it authoritative
    pub fn commit(&self, current: &mut ActiveTable) -> FirmwareResult<()> {
        let version = current.table.version().saturating_add(1);
        current.table.set_validity(TableValidity {
            flags: [FIS_FLAG_IN_PROGRESS; 2],
            version,
        });

        let mut handle = FlashHandle::open(self.provider.as_ref(), &current.alternate)?;
        debug!("Erasing alternate table {}", current.alternate);
        handle.erase(handle.size())?;

        let encoded = current.table.encode();
        handle.program_at(&encoded, 0)?;
        trace!("Wrote in-progress table to {}", current.alternate);

        handle.program_at(&[FIS_FLAG_VALID; 2], FIS_FLAGS_OFFSET as u64)?;
        handle.close();

        current.table.set_flags(FIS_FLAG_VALID);
        std::mem::swap(&mut current.active, &mut current.alternate);
        info!(
            "Committed partition table version {} to {}",
            version, current.active
        );
        Ok(())
    }

    /// Initialise both regions: a valid table holding `entries` in the
    /// primary region, an erased redundant region
    pub fn format(&self, entries: &[FisDescriptor]) -> FirmwareResult<()> {
        let mut primary = FlashHandle::open(self.provider.as_ref(), &self.primary)?;
        let slots = usize::try_from(primary.size()).unwrap_or(0) / FIS_ENTRY_SIZE;
        let table = FisTable::with_entries(slots, entries)?;
        primary.erase(primary.size())?;
        primary.program_at(&table.encode(), 0)?;
        primary.close();

        let mut redundant = FlashHandle::open(self.provider.as_ref(), &self.redundant)?;
        redundant.erase(redundant.size())?;
        redundant.close();
        info!(
            "Formatted partition tables {} and {} with {} entries",
            self.primary,
            self.redundant,
            entries.len()
        );
        Ok(())
    }

    /// Descriptor of partition `name` in the authoritative table
    pub fn find(&self, name: &str) -> FirmwareResult<Option<FisDescriptor>> {
        Ok(self.read()?.table.find(name).cloned())
    }

    /// Partition entries of the authoritative table
    pub fn list(&self) -> FirmwareResult<Vec<FisDescriptor>> {
        Ok(self.read()?.table.entries().cloned().collect())
    }

    /// Change the size of partition `name` and commit
    pub fn resize(&self, name: &str, new_size: u32) -> FirmwareResult<()> {
        let mut current = self.read()?;
        let desc = current
            .table
            .find_mut(name)
            .ok_or_else(|| FirmwareError::PartitionNotFound(name.to_string()))?;
        desc.size = new_size;
        desc.data_length = new_size;
        self.commit(&mut current)
    }

    /// Exchange the names of partitions `a` and `b` and commit
    pub fn swap_active(&self, a: &str, b: &str) -> FirmwareResult<()> {
        let mut current = self.read()?;
        let (Some(first), Some(second)) = (current.table.position(a), current.table.position(b))
        else {
            let missing = if current.table.position(a).is_none() { a } else { b };
            warn!("Unable to swap, {} not found", missing);
            return Err(FirmwareError::PartitionNotFound(missing.to_string()));
        };
        let first_name = current.table.slots.get(first).map(|d| d.name);
        let second_name = current.table.slots.get(second).map(|d| d.name);
        if let (Some(slot), Some(name)) = (current.table.slots.get_mut(first), second_name) {
            slot.name = name;
        }
        if let (Some(slot), Some(name)) = (current.table.slots.get_mut(second), first_name) {
            slot.name = name;
        }
        self.commit(&mut current)
    }

    /// Carve `backup` out of the tail of `primary` and commit
    ///
    /// # Errors
    ///
    /// `PartitionExists` when `backup` is already present, `PartitionNotFound`
    /// when `primary` is missing, `Config` when the sizes do not fit and
    /// `TableFull` when no slot is free.
    pub fn split(
        &self,
        primary: &str,
        primary_size: u32,
        backup: &str,
        backup_size: u32,
    ) -> FirmwareResult<()> {
        let mut current = self.read()?;
        if current.table.find(backup).is_some() {
            return Err(FirmwareError::PartitionExists(backup.to_string()));
        }
        let desc = current
            .table
            .find_mut(primary)
            .ok_or_else(|| FirmwareError::PartitionNotFound(primary.to_string()))?;
        let total = primary_size.checked_add(backup_size);
        if total.is_none_or(|total| total > desc.size) {
            return Err(FirmwareError::config(format!(
                "{} is {} bytes, cannot hold {} + {}",
                primary, desc.size, primary_size, backup_size
            )));
        }

        let mut entry = desc.clone();
        entry.set_name(backup);
        entry.flash_base = desc.flash_base.saturating_add(primary_size);
        entry.size = backup_size;
        entry.data_length = entry.data_length.min(backup_size);
        desc.size = primary_size;
        desc.data_length = desc.data_length.min(primary_size);

        current.table.insert_before(primary, entry)?;
        debug!(
            "Split {} into {} + {} bytes",
            primary, primary_size, backup_size
        );
        self.commit(&mut current)
    }
}
