//! Bounds-checked cursor over `{type, tlv_len, data_len, value}` records
//!
//! Stage-1 images and sideband records share this layout. The cursor never
//! trusts a length field before checking it against the remaining span, and
//! stops for good after the first malformed record.

use crate::error::ImageError;

/// Size of a `{type, tlv_len, data_len}` record header
pub const TLV_HEADER_SIZE: usize = 12;

/// Records are padded so `tlv_len` is a multiple of this
pub const TLV_ALIGN: usize = 4;

/// Read a little-endian `u32` at `offset`
pub(crate) fn le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes: [u8; 4] = buf.get(offset..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Overwrite a little-endian `u32` at `offset`, returning false when it does
/// not fit
pub(crate) fn put_le_u32(buf: &mut [u8], offset: usize, value: u32) -> bool {
    let Some(end) = offset.checked_add(4) else {
        return false;
    };
    match buf.get_mut(offset..end) {
        Some(target) => {
            target.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

/// Round `len` up to the record alignment
pub(crate) fn align4(len: usize) -> usize {
    len.div_ceil(TLV_ALIGN).saturating_mul(TLV_ALIGN)
}

/// Location of one record inside its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvView {
    /// Raw record type
    pub kind: u32,
    /// Offset of the record header
    pub offset: usize,
    /// Total record length including header and padding
    pub tlv_len: usize,
    /// Offset of the value bytes
    pub data_offset: usize,
    /// Number of meaningful value bytes
    pub data_len: usize,
}

impl TlvView {
    /// Value bytes of this record within `buf`
    pub fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.data_offset..self.data_offset.saturating_add(self.data_len))
            .unwrap_or_default()
    }

    /// Offset just past this record
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.tlv_len)
    }
}

/// Encode one padded record
pub fn encode_tlv(kind: u32, data: &[u8]) -> Vec<u8> {
    let tlv_len = align4(TLV_HEADER_SIZE.saturating_add(data.len()));
    let mut out = Vec::with_capacity(tlv_len);
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&u32::try_from(tlv_len).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(&u32::try_from(data.len()).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(data);
    out.resize(tlv_len, 0);
    out
}

/// Iterator over the records in `buf[start..end]`
#[derive(Debug, Clone)]
pub struct TlvCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    end: usize,
    failed: bool,
}

impl<'a> TlvCursor<'a> {
    /// Walk records from `start` up to `end`; `end` is clamped to the buffer
    pub fn new(buf: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            buf,
            offset: start,
            end: end.min(buf.len()),
            failed: false,
        }
    }

    fn fail(&mut self, reason: &str) -> Option<Result<TlvView, ImageError>> {
        self.failed = true;
        Some(Err(ImageError::malformed(self.offset, reason)))
    }
}

impl Iterator for TlvCursor<'_> {
    type Item = Result<TlvView, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.end {
            return None;
        }
        let remaining = self.end.saturating_sub(self.offset);
        if remaining < TLV_HEADER_SIZE {
            return self.fail("truncated record header");
        }

        let header = (
            le_u32(self.buf, self.offset),
            le_u32(self.buf, self.offset.saturating_add(4)),
            le_u32(self.buf, self.offset.saturating_add(8)),
        );
        let (Some(kind), Some(tlv_len), Some(data_len)) = header else {
            return self.fail("truncated record header");
        };
        let tlv_len = usize::try_from(tlv_len).unwrap_or(usize::MAX);
        let data_len = usize::try_from(data_len).unwrap_or(usize::MAX);

        if tlv_len < TLV_HEADER_SIZE {
            return self.fail("record length below header size");
        }
        if tlv_len > remaining {
            return self.fail("record runs past the declared length");
        }
        if tlv_len % TLV_ALIGN != 0 {
            return self.fail("record length not 4-byte aligned");
        }
        if data_len > tlv_len.saturating_sub(TLV_HEADER_SIZE) {
            return self.fail("data length exceeds record");
        }

        let view = TlvView {
            kind,
            offset: self.offset,
            tlv_len,
            data_offset: self.offset.saturating_add(TLV_HEADER_SIZE),
            data_len,
        };
        self.offset = view.end();
        Some(Ok(view))
    }
}
