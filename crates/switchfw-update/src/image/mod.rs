//! Firmware image format
//!
//! An image is a fixed little-endian header followed by a TLV stream up to
//! `image_len`; an optional stage-2 trailer may follow `image_len` in the same
//! buffer.
//!
//! | offset | field            | size |
//! |--------|------------------|------|
//! | 0      | `magic1`         | 4    |
//! | 4      | `magic2`         | 4    |
//! | 8      | `version`        | 4    |
//! | 12     | `header_len`     | 4    |
//! | 16     | `image_len`      | 4    |
//! | 20     | `machine`        | 32   |
//! | 52     | `soc_name`       | 32   |
//! | 84     | `soc_id`         | 4    |
//! | 88     | `signature_type` | 4    |
//!
//! Everything here treats the buffer as hostile: every length is checked
//! against what is actually available before it is used.

pub mod builder;
pub mod stage2;
pub mod validate;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{FirmwareResult, ImageError};
use crate::flash::FlashHandle;
use crate::tlv::{TLV_ALIGN, TLV_HEADER_SIZE, TlvCursor, TlvView, le_u32};

pub use builder::{ImageBuilder, Stage2Record, image_md5_hex};
pub use stage2::{
    STAGE2_HEADER_SIZE, STAGE2_MAGIC, Stage2Tlv, Stage2Type, Stage2Walker, check_stage2_tlv,
    create_filename_tlv, last_bootloader, stage2_records,
};
pub use validate::{ImageInfo, ImageValidator};

/// First image magic word
pub const IMAGE_MAGIC1: u32 = 0xEDD4_D5DE;
/// Second image magic word
pub const IMAGE_MAGIC2: u32 = 0x987B_4C4D;
/// Oldest supported header format version
pub const IMAGE_MIN_VERSION: u32 = 1;
/// Header format version written by [`ImageBuilder`]
pub const IMAGE_VERSION: u32 = 1;
/// Size of the fixed header
pub const IMAGE_HEADER_SIZE: usize = 92;
/// Size of the machine and SoC name fields
pub const NAME_FIELD_SIZE: usize = 32;

/// Stage-1 record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TlvType {
    /// Kernel payload
    Kernel = 1,
    /// Embedded image signature
    Signature = 2,
    /// Initial ramdisk
    Initrd = 3,
    /// Kernel command line
    KernelCmd = 4,
    /// Free-form metadata
    Metadata = 5,
    /// License texts
    Licenses = 6,
    /// Stage-2 marker
    Stage2 = 7,
}

impl TlvType {
    /// Decode a raw type, `None` for unknown values
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(TlvType::Kernel),
            2 => Some(TlvType::Signature),
            3 => Some(TlvType::Initrd),
            4 => Some(TlvType::KernelCmd),
            5 => Some(TlvType::Metadata),
            6 => Some(TlvType::Licenses),
            7 => Some(TlvType::Stage2),
            _ => None,
        }
    }

    /// Raw wire value
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Decoded fixed image header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// First magic word
    pub magic1: u32,
    /// Second magic word
    pub magic2: u32,
    /// Header format version
    pub version: u32,
    /// Header length; the TLV stream starts here
    pub header_len: u32,
    /// Length of the stage-1 image including header
    pub image_len: u32,
    /// NUL-padded target machine name
    pub machine: [u8; NAME_FIELD_SIZE],
    /// NUL-padded SoC name
    pub soc_name: [u8; NAME_FIELD_SIZE],
    /// Chip family identifier
    pub soc_id: u32,
    /// Signature algorithm tag
    pub signature_type: u32,
}

fn name_field(buf: &[u8], offset: usize) -> Option<[u8; NAME_FIELD_SIZE]> {
    buf.get(offset..offset.checked_add(NAME_FIELD_SIZE)?)?
        .try_into()
        .ok()
}

fn field_to_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(field.get(..end).unwrap_or_default()).into_owned()
}

/// NUL-pad `name` into a fixed field, truncating so a terminator remains
pub fn string_to_field(name: &str) -> [u8; NAME_FIELD_SIZE] {
    let mut field = [0u8; NAME_FIELD_SIZE];
    let len = name.len().min(NAME_FIELD_SIZE.saturating_sub(1));
    if let (Some(dst), Some(src)) = (field.get_mut(..len), name.as_bytes().get(..len)) {
        dst.copy_from_slice(src);
    }
    field
}

impl ImageHeader {
    /// Header with both magics, the current version and the given identity
    pub fn new(machine: &str, soc_name: &str, soc_id: u32, signature_type: u32) -> Self {
        Self {
            magic1: IMAGE_MAGIC1,
            magic2: IMAGE_MAGIC2,
            version: IMAGE_VERSION,
            header_len: IMAGE_HEADER_SIZE as u32,
            image_len: IMAGE_HEADER_SIZE as u32,
            machine: string_to_field(machine),
            soc_name: string_to_field(soc_name),
            soc_id,
            signature_type,
        }
    }

    /// Decode the fixed header without checking it
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::ShortHeader`] when `buf` is shorter than the
    /// fixed header.
    pub fn parse(buf: &[u8]) -> Result<Self, ImageError> {
        let short = || ImageError::ShortHeader {
            actual: buf.len(),
            required: IMAGE_HEADER_SIZE,
        };
        if buf.len() < IMAGE_HEADER_SIZE {
            return Err(short());
        }
        Ok(Self {
            magic1: le_u32(buf, 0).ok_or_else(short)?,
            magic2: le_u32(buf, 4).ok_or_else(short)?,
            version: le_u32(buf, 8).ok_or_else(short)?,
            header_len: le_u32(buf, 12).ok_or_else(short)?,
            image_len: le_u32(buf, 16).ok_or_else(short)?,
            machine: name_field(buf, 20).ok_or_else(short)?,
            soc_name: name_field(buf, 52).ok_or_else(short)?,
            soc_id: le_u32(buf, 84).ok_or_else(short)?,
            signature_type: le_u32(buf, 88).ok_or_else(short)?,
        })
    }

    /// Encode the fixed header
    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut out = [0u8; IMAGE_HEADER_SIZE];
        let words = [
            (0usize, self.magic1),
            (4, self.magic2),
            (8, self.version),
            (12, self.header_len),
            (16, self.image_len),
            (84, self.soc_id),
            (88, self.signature_type),
        ];
        for (offset, value) in words {
            crate::tlv::put_le_u32(&mut out, offset, value);
        }
        if let Some(dst) = out.get_mut(20..52) {
            dst.copy_from_slice(&self.machine);
        }
        if let Some(dst) = out.get_mut(52..84) {
            dst.copy_from_slice(&self.soc_name);
        }
        out
    }

    /// Whether both magic words match
    pub fn has_valid_magic(&self) -> bool {
        self.magic1 == IMAGE_MAGIC1 && self.magic2 == IMAGE_MAGIC2
    }

    /// Target machine name
    pub fn machine_name(&self) -> String {
        field_to_string(&self.machine)
    }

    /// SoC name
    pub fn soc_name(&self) -> String {
        field_to_string(&self.soc_name)
    }

    /// Declared image length as `usize`
    pub fn image_len(&self) -> usize {
        usize::try_from(self.image_len).unwrap_or(usize::MAX)
    }

    /// Declared header length as `usize`
    pub fn header_len(&self) -> usize {
        usize::try_from(self.header_len).unwrap_or(usize::MAX)
    }

    /// Records of the stage-1 image in `image`
    pub fn tlvs<'a>(&self, image: &'a [u8]) -> TlvCursor<'a> {
        TlvCursor::new(image, self.header_len(), self.image_len())
    }
}

/// Check the structure of an image header against the buffer holding it and
/// the running chip family
///
/// # Errors
///
/// Fails with `ShortHeader`, `BadMagic`, `VersionTooOld`, `Truncated` or
/// `WrongChipFamily`.
pub fn check_header(image: &[u8], soc_family: u32) -> Result<ImageHeader, ImageError> {
    let header = ImageHeader::parse(image)?;
    if !header.has_valid_magic() {
        return Err(ImageError::BadMagic {
            magic1: header.magic1,
            magic2: header.magic2,
        });
    }
    if header.version < IMAGE_MIN_VERSION {
        return Err(ImageError::VersionTooOld(header.version));
    }
    if header.header_len() < IMAGE_HEADER_SIZE {
        return Err(ImageError::ShortHeader {
            actual: header.header_len(),
            required: IMAGE_HEADER_SIZE,
        });
    }
    if header.image_len() > image.len() {
        return Err(ImageError::Truncated {
            declared: header.image_len(),
            actual: image.len(),
        });
    }
    if header.header_len() > header.image_len() {
        return Err(ImageError::Truncated {
            declared: header.header_len(),
            actual: header.image_len(),
        });
    }
    if header.soc_id != soc_family {
        return Err(ImageError::WrongChipFamily {
            expected: soc_family,
            actual: header.soc_id,
        });
    }
    trace!(
        "Image header ok: machine '{}', {} bytes",
        header.machine_name(),
        header.image_len
    );
    Ok(header)
}

/// First stage-1 record of type `kind`
///
/// # Errors
///
/// Returns [`ImageError::MalformedTlv`] when the scan meets a record whose
/// length is impossible; the scan never reads past `image_len`.
pub fn find_tlv(
    image: &[u8],
    header: &ImageHeader,
    kind: TlvType,
) -> Result<Option<TlvView>, ImageError> {
    for view in header.tlvs(image) {
        let view = view?;
        if view.kind == kind.as_raw() {
            trace!("Found TLV {:?} at {}", kind, view.offset);
            return Ok(Some(view));
        }
    }
    Ok(None)
}

/// Read and magic-check the header of the image installed in `handle`
pub fn read_header_from_flash(handle: &mut FlashHandle) -> FirmwareResult<ImageHeader> {
    let mut buf = [0u8; IMAGE_HEADER_SIZE];
    handle.read_at(0, &mut buf)?;
    let header = ImageHeader::parse(&buf)?;
    if !header.has_valid_magic() {
        return Err(ImageError::BadMagic {
            magic1: header.magic1,
            magic2: header.magic2,
        }
        .into());
    }
    if header.image_len as u64 > handle.size() || header.header_len() < IMAGE_HEADER_SIZE {
        return Err(ImageError::Truncated {
            declared: header.image_len(),
            actual: usize::try_from(handle.size()).unwrap_or(usize::MAX),
        }
        .into());
    }
    Ok(header)
}

/// Value of the first stage-1 record of type `kind` in the image installed in
/// `handle`, reading record headers one at a time
pub fn find_tlv_in_flash(
    handle: &mut FlashHandle,
    header: &ImageHeader,
    kind: TlvType,
) -> FirmwareResult<Option<Vec<u8>>> {
    let end = u64::from(header.image_len);
    let mut offset = u64::from(header.header_len);
    let mut record = [0u8; TLV_HEADER_SIZE];
    while offset.saturating_add(TLV_HEADER_SIZE as u64) <= end {
        handle.read_at(offset, &mut record)?;
        let record_offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let (Some(raw_kind), Some(tlv_len), Some(data_len)) = (
            le_u32(&record, 0),
            le_u32(&record, 4),
            le_u32(&record, 8),
        ) else {
            return Err(ImageError::malformed(record_offset, "unreadable record header").into());
        };
        let tlv_end = offset.saturating_add(u64::from(tlv_len));
        if (tlv_len as usize) < TLV_HEADER_SIZE
            || tlv_len as usize % TLV_ALIGN != 0
            || tlv_end > end
            || u64::from(data_len) > u64::from(tlv_len).saturating_sub(TLV_HEADER_SIZE as u64)
        {
            return Err(ImageError::malformed(record_offset, "record runs past the image").into());
        }
        if raw_kind == kind.as_raw() {
            let data_len = usize::try_from(data_len).unwrap_or(usize::MAX);
            let data = handle.read_vec(offset.saturating_add(TLV_HEADER_SIZE as u64), data_len)?;
            return Ok(Some(data));
        }
        offset = tlv_end;
    }
    Ok(None)
}
