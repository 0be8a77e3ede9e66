//! Stage-2 trailer
//!
//! Records follow the stage-1 image back to back. Each one carries its own
//! magic and signature:
//!
//! ```text
//! magic | type | tlv_len | data_len | sig_type | data | signature
//! ```
//!
//! The signature starts right after the data, so its length is
//! `tlv_len - data_len - 20` and must match the record's scheme. It is
//! computed over everything before it, record header included. Records are
//! not padded.

use serde::{Deserialize, Serialize};
use switchfw_crypto::{SignatureType, md5_digest};
use tracing::{debug, trace};

use super::validate::ImageValidator;
use crate::error::{FirmwareResult, ImageError};
use crate::tlv::{le_u32, put_le_u32};

/// Stage-2 record magic
pub const STAGE2_MAGIC: u32 = 0xA7E2_1C7B;
/// Size of a stage-2 record header
pub const STAGE2_HEADER_SIZE: usize = 20;

/// Stage-2 record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Stage2Type {
    /// Bootloader update
    Bootloader = 1,
    /// Secondary root filesystem
    Rootfs = 2,
    /// Name under which the trailer is persisted
    Filename = 3,
}

impl Stage2Type {
    /// Decode a raw type, `None` outside the known range
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Stage2Type::Bootloader),
            2 => Some(Stage2Type::Rootfs),
            3 => Some(Stage2Type::Filename),
            _ => None,
        }
    }

    /// Raw wire value
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// A checked stage-2 record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Tlv {
    /// Record type
    pub kind: Stage2Type,
    /// Offset of the record within the trailer
    pub offset: usize,
    /// Total record length
    pub tlv_len: usize,
    /// Payload length
    pub data_len: usize,
    /// Signature scheme of the record
    pub signature_type: SignatureType,
}

impl Stage2Tlv {
    /// Payload bytes within `trailer`
    pub fn data<'a>(&self, trailer: &'a [u8]) -> &'a [u8] {
        let start = self.offset.saturating_add(STAGE2_HEADER_SIZE);
        trailer
            .get(start..start.saturating_add(self.data_len))
            .unwrap_or_default()
    }

    /// Offset just past this record
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.tlv_len)
    }

    fn signature_len(&self) -> usize {
        self.signature_type.signature_len().unwrap_or(0)
    }

    /// Bytes covered by the record signature
    pub fn signed_bytes<'a>(&self, trailer: &'a [u8]) -> &'a [u8] {
        let end = self.end().saturating_sub(self.signature_len());
        trailer.get(self.offset..end).unwrap_or_default()
    }

    /// Record signature
    pub fn signature<'a>(&self, trailer: &'a [u8]) -> &'a [u8] {
        let start = self.end().saturating_sub(self.signature_len());
        trailer.get(start..self.end()).unwrap_or_default()
    }

    /// Payload interpreted as a NUL-terminated name
    pub fn name(&self, trailer: &[u8]) -> String {
        let data = self.data(trailer);
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        String::from_utf8_lossy(data.get(..end).unwrap_or_default()).into_owned()
    }
}

fn stage2_error(offset: usize, reason: &str) -> ImageError {
    ImageError::Stage2(format!("{} at offset {}", reason, offset))
}

/// Check the record at `offset` of `trailer`
///
/// With a validator the record signature is verified as well; without one
/// only the structure is checked.
///
/// # Errors
///
/// Returns [`ImageError::Stage2`] for a bad magic, an impossible length or an
/// unknown type, and a signature error when verification is requested and
/// fails.
pub fn check_stage2_tlv(
    trailer: &[u8],
    offset: usize,
    verifier: Option<&ImageValidator>,
) -> FirmwareResult<Stage2Tlv> {
    let remaining = trailer.len().saturating_sub(offset);
    if remaining < STAGE2_HEADER_SIZE {
        return Err(stage2_error(offset, "truncated record header").into());
    }
    let field = |n: usize| le_u32(trailer, offset.saturating_add(n.saturating_mul(4)));
    let (Some(magic), Some(raw_kind), Some(tlv_len), Some(data_len), Some(raw_sig)) =
        (field(0), field(1), field(2), field(3), field(4))
    else {
        return Err(stage2_error(offset, "truncated record header").into());
    };
    if magic != STAGE2_MAGIC {
        return Err(stage2_error(offset, "bad magic").into());
    }

    let tlv_len = usize::try_from(tlv_len).unwrap_or(usize::MAX);
    let data_len = usize::try_from(data_len).unwrap_or(usize::MAX);
    if tlv_len < STAGE2_HEADER_SIZE || tlv_len > remaining {
        return Err(stage2_error(offset, "record length outside the trailer").into());
    }

    let Some(signature_len) = tlv_len
        .saturating_sub(STAGE2_HEADER_SIZE)
        .checked_sub(data_len)
    else {
        return Err(stage2_error(offset, "data length exceeds record").into());
    };
    let signature_type = SignatureType::from_raw(raw_sig)
        .ok_or_else(|| stage2_error(offset, "unknown signature type"))?;
    if signature_len != signature_type.signature_len().unwrap_or(0) {
        return Err(stage2_error(
            offset,
            &format!("{} byte signature does not fit {}", signature_len, signature_type),
        )
        .into());
    }

    let kind = Stage2Type::from_raw(raw_kind)
        .ok_or_else(|| stage2_error(offset, "unknown record type"))?;
    let record = Stage2Tlv {
        kind,
        offset,
        tlv_len,
        data_len,
        signature_type,
    };

    if let Some(validator) = verifier {
        validator.check_stage2_scheme(kind, signature_type)?;
        validator.verify_fragments(
            signature_type,
            &[record.signed_bytes(trailer)],
            record.signature(trailer),
        )?;
        trace!("Stage-2 {:?} record at {} verified", kind, offset);
    }
    Ok(record)
}

/// Iterator over the records of a trailer
///
/// Stops after the first error. Bytes left over that cannot hold a record
/// header are reported as an error.
#[derive(Debug)]
pub struct Stage2Walker<'a> {
    trailer: &'a [u8],
    offset: usize,
    verifier: Option<&'a ImageValidator>,
    failed: bool,
}

impl<'a> Stage2Walker<'a> {
    /// Walk `trailer`, verifying signatures when a validator is given
    pub fn new(trailer: &'a [u8], verifier: Option<&'a ImageValidator>) -> Self {
        Self {
            trailer,
            offset: 0,
            verifier,
            failed: false,
        }
    }
}

impl Iterator for Stage2Walker<'_> {
    type Item = FirmwareResult<Stage2Tlv>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.trailer.len() {
            return None;
        }
        match check_stage2_tlv(self.trailer, self.offset, self.verifier) {
            Ok(record) => {
                self.offset = record.end();
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Every record of `trailer`
pub fn stage2_records(
    trailer: &[u8],
    verifier: Option<&ImageValidator>,
) -> FirmwareResult<Vec<Stage2Tlv>> {
    let records = Stage2Walker::new(trailer, verifier).collect::<FirmwareResult<Vec<_>>>()?;
    if !records.is_empty() {
        debug!("Stage-2 trailer holds {} records", records.len());
    }
    Ok(records)
}

/// The authoritative bootloader record: the last one present
pub fn last_bootloader(records: &[Stage2Tlv]) -> Option<&Stage2Tlv> {
    records
        .iter()
        .rev()
        .find(|record| record.kind == Stage2Type::Bootloader)
}

/// Build a signed stage-2 record
///
/// The signature bytes are left zero; `sign` receives the bytes the
/// signature covers and returns the signature.
pub(crate) fn encode_stage2_record(
    kind: Stage2Type,
    signature_type: SignatureType,
    data: &[u8],
    sign: impl FnOnce(&[u8]) -> FirmwareResult<Vec<u8>>,
) -> FirmwareResult<Vec<u8>> {
    let signature_len = signature_type.signature_len().unwrap_or(0);
    let tlv_len = STAGE2_HEADER_SIZE
        .saturating_add(data.len())
        .saturating_add(signature_len);
    let mut out = vec![0u8; tlv_len];
    let words = [
        STAGE2_MAGIC,
        kind.as_raw(),
        u32::try_from(tlv_len).unwrap_or(u32::MAX),
        u32::try_from(data.len()).unwrap_or(u32::MAX),
        signature_type.as_raw(),
    ];
    for (i, word) in words.into_iter().enumerate() {
        put_le_u32(&mut out, i.saturating_mul(4), word);
    }
    if let Some(dst) = out.get_mut(STAGE2_HEADER_SIZE..STAGE2_HEADER_SIZE.saturating_add(data.len()))
    {
        dst.copy_from_slice(data);
    }

    let signed_end = tlv_len.saturating_sub(signature_len);
    if signature_len > 0 {
        let signature = sign(out.get(..signed_end).unwrap_or_default())?;
        signature_type.check_signature_len(signature.len())?;
        if let Some(dst) = out.get_mut(signed_end..) {
            dst.copy_from_slice(&signature);
        }
    }
    Ok(out)
}

/// Stage-2 filename record for `name`, MD5-signed over everything but its
/// final 16 bytes
///
/// Returns `None` for an empty name.
pub fn create_filename_tlv(name: &str) -> Option<Vec<u8>> {
    if name.is_empty() {
        return None;
    }
    let mut data = name.as_bytes().to_vec();
    data.push(0);
    encode_stage2_record(
        Stage2Type::Filename,
        SignatureType::Md5,
        &data,
        |signed| Ok(md5_digest(signed).to_vec()),
    )
    .ok()
}
