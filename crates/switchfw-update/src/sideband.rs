//! Sideband metadata stored after an image
//!
//! The record sits at the first erase-block boundary past the image and
//! carries bookkeeping the image itself cannot: the name the image was
//! uploaded under and the name of its persisted stage-2 trailer.
//!
//! ```text
//! magic1 | magic2 | checksum[16] | length | TLVs...
//! ```
//!
//! `checksum` is the MD5 of the first `length` bytes with the checksum field
//! zeroed. A missing or corrupt record reads as `None`; sideband data must
//! never block an update.

use switchfw_crypto::md5_digest;
use tracing::{debug, info, trace};

use crate::error::FirmwareResult;
use crate::flash::{FlashHandle, align_up};
use crate::tlv::{TlvCursor, encode_tlv, le_u32, put_le_u32};

/// First sideband magic word
pub const SIDEBAND_MAGIC1: u32 = 0x4E44_4953;
/// Second sideband magic word
pub const SIDEBAND_MAGIC2: u32 = 0x4241_4E44;
/// Size of the fixed sideband header
pub const SIDEBAND_HEADER_SIZE: usize = 28;

const CHECKSUM_OFFSET: usize = 8;
const CHECKSUM_LEN: usize = 16;
const LENGTH_OFFSET: usize = 24;

/// Sideband record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SidebandType {
    /// Name the image was uploaded under
    Filename = 1,
    /// Name of the persisted stage-2 trailer
    Stage2Filename = 2,
}

impl SidebandType {
    /// Raw wire value
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Decoded sideband record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidebandRecord {
    tlvs: Vec<(u32, Vec<u8>)>,
}

fn nul_terminated(name: &str) -> Vec<u8> {
    let mut data = name.as_bytes().to_vec();
    data.push(0);
    data
}

fn as_name(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(data.get(..end).unwrap_or_default()).into_owned()
}

impl SidebandRecord {
    /// Empty record holding only the header
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded length in bytes
    pub fn length(&self) -> usize {
        self.tlvs.iter().fold(SIDEBAND_HEADER_SIZE, |len, (_, data)| {
            len.saturating_add(encode_tlv(0, data).len())
        })
    }

    /// Value of the first record of `kind`
    pub fn find_tlv(&self, kind: SidebandType) -> Option<&[u8]> {
        self.tlvs
            .iter()
            .find(|(raw, _)| *raw == kind.as_raw())
            .map(|(_, data)| data.as_slice())
    }

    /// Append a record
    pub fn add_tlv(&mut self, kind: SidebandType, data: &[u8]) {
        self.tlvs.push((kind.as_raw(), data.to_vec()));
    }

    /// Remove every record of `kind`
    pub fn delete_tlv(&mut self, kind: SidebandType) {
        self.tlvs.retain(|(raw, _)| *raw != kind.as_raw());
    }

    /// Replace every record of `kind` with a single one
    pub fn set_tlv(&mut self, kind: SidebandType, data: &[u8]) {
        self.delete_tlv(kind);
        self.add_tlv(kind, data);
    }

    /// Name the image was uploaded under
    pub fn filename(&self) -> Option<String> {
        self.find_tlv(SidebandType::Filename).map(as_name)
    }

    /// Record the upload name
    pub fn set_filename(&mut self, name: &str) {
        self.set_tlv(SidebandType::Filename, &nul_terminated(name));
    }

    /// Name of the persisted stage-2 trailer
    pub fn stage2_filename(&self) -> Option<String> {
        self.find_tlv(SidebandType::Stage2Filename).map(as_name)
    }

    /// Record the stage-2 trailer name
    pub fn set_stage2_filename(&mut self, name: &str) {
        self.set_tlv(SidebandType::Stage2Filename, &nul_terminated(name));
    }

    /// Encode with a freshly computed checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; SIDEBAND_HEADER_SIZE];
        put_le_u32(&mut out, 0, SIDEBAND_MAGIC1);
        put_le_u32(&mut out, 4, SIDEBAND_MAGIC2);
        for (kind, data) in &self.tlvs {
            out.extend(encode_tlv(*kind, data));
        }
        let length = u32::try_from(out.len()).unwrap_or(u32::MAX);
        put_le_u32(&mut out, LENGTH_OFFSET, length);
        let checksum = md5_digest(&out);
        if let Some(dst) = out.get_mut(CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN) {
            dst.copy_from_slice(&checksum);
        }
        out
    }

    /// Decode and checksum-verify a record at the start of `buf`
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let length = Self::check_header(buf)?;
        let mut record = buf.get(..length)?.to_vec();
        let stored: [u8; CHECKSUM_LEN] = record
            .get(CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN)?
            .try_into()
            .ok()?;
        record
            .get_mut(CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN)?
            .fill(0);
        if md5_digest(&record) != stored {
            debug!("Sideband checksum mismatch");
            return None;
        }

        let mut tlvs = Vec::new();
        for view in TlvCursor::new(&record, SIDEBAND_HEADER_SIZE, length) {
            let view = view
                .inspect_err(|e| debug!("Sideband record rejected: {}", e))
                .ok()?;
            tlvs.push((view.kind, view.data(&record).to_vec()));
        }
        Some(Self { tlvs })
    }

    fn check_header(buf: &[u8]) -> Option<usize> {
        if le_u32(buf, 0)? != SIDEBAND_MAGIC1 || le_u32(buf, 4)? != SIDEBAND_MAGIC2 {
            return None;
        }
        let length = usize::try_from(le_u32(buf, LENGTH_OFFSET)?).ok()?;
        (length >= SIDEBAND_HEADER_SIZE).then_some(length)
    }

    /// Offset of the sideband for an image of `image_len` bytes
    pub fn offset_for(handle: &FlashHandle, image_len: u64) -> u64 {
        align_up(image_len, handle.erase_size())
    }

    /// Read the record stored at `offset`
    ///
    /// Only flash I/O failures are errors; an absent or corrupt record is
    /// `Ok(None)`.
    pub fn read(handle: &mut FlashHandle, offset: u64) -> FirmwareResult<Option<Self>> {
        let available = handle.size().saturating_sub(offset);
        if available < SIDEBAND_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let header = handle.read_vec(offset, SIDEBAND_HEADER_SIZE)?;
        let Some(length) = Self::check_header(&header) else {
            trace!("No sideband at {:#x} of {}", offset, handle.name());
            return Ok(None);
        };
        if length as u64 > available {
            debug!("Sideband at {:#x} claims {} bytes", offset, length);
            return Ok(None);
        }
        let record = handle.read_vec(offset, length)?;
        let decoded = Self::decode(&record);
        if decoded.is_some() {
            info!("Read sideband at {:#x} of {}", offset, handle.name());
        }
        Ok(decoded)
    }

    /// Erase the blocks under `offset` and write the record there
    pub fn write(&self, handle: &mut FlashHandle, offset: u64) -> FirmwareResult<()> {
        let encoded = self.encode();
        handle.erase_at(offset, encoded.len() as u64)?;
        handle.program_at(&encoded, offset)?;
        info!(
            "Wrote {} byte sideband at {:#x} of {}",
            encoded.len(),
            offset,
            handle.name()
        );
        Ok(())
    }
}
