//! Error types for firmware update operations
//!
//! Each component has its own error enum; all of them fold into
//! [`FirmwareError`], whose [`FirmwareError::kind`] classifies the failure for
//! callers that only care whether to retry, re-send, or give up.

use switchfw_crypto::CryptoError;
use thiserror::Error;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed header or TLV stream, wrong chip family or board
    Format,
    /// Missing or invalid signature
    Authentication,
    /// Erase, program or read failure on the physical device
    Flash,
    /// The single download slot is occupied
    ResourceBusy,
    /// Out-of-order chunk, incomplete chunk set, unknown session
    Protocol,
    /// Partition or device missing, image larger than its target
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Format => "format",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Flash => "flash",
            ErrorKind::ResourceBusy => "resource busy",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Errors raised by flash devices
#[derive(Error, Debug)]
pub enum FlashError {
    /// No flash region with this name
    #[error("Flash device not found: {0}")]
    NotFound(String),

    /// Access outside the device
    #[error("Access out of bounds: offset {offset:#x} length {length} exceeds device size {size:#x}")]
    OutOfBounds {
        /// Start of the access
        offset: u64,
        /// Length of the access
        length: u64,
        /// Device size
        size: u64,
    },

    /// Erase of a block failed
    #[error("Erase failed at {offset:#x}: {reason}")]
    EraseFailed {
        /// Block offset
        offset: u64,
        /// Device-reported reason
        reason: String,
    },

    /// Program operation failed
    #[error("Program failed at {offset:#x}: {reason}")]
    ProgramFailed {
        /// Write offset
        offset: u64,
        /// Device-reported reason
        reason: String,
    },

    /// Read operation failed
    #[error("Read failed at {offset:#x}: {reason}")]
    ReadFailed {
        /// Read offset
        offset: u64,
        /// Device-reported reason
        reason: String,
    },

    /// Device accepted fewer bytes than requested
    #[error("Short write at {offset:#x}: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Write offset
        offset: u64,
        /// Requested length
        expected: usize,
        /// Accepted length
        written: usize,
    },

    /// I/O error from a file-backed device
    #[error("Flash I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for flash operations
pub type FlashResult<T> = Result<T, FlashError>;

/// Structural errors in firmware images
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Buffer or declared header shorter than the fixed header
    #[error("Short header: {actual} bytes, need {required}")]
    ShortHeader {
        /// Available or declared length
        actual: usize,
        /// Fixed header size
        required: usize,
    },

    /// Magic pair mismatch
    #[error("Bad image magic: {magic1:#010x} {magic2:#010x}")]
    BadMagic {
        /// First magic word found
        magic1: u32,
        /// Second magic word found
        magic2: u32,
    },

    /// Header format version below the supported minimum
    #[error("Image format version {0} is too old")]
    VersionTooOld(u32),

    /// Image built for another chip family
    #[error("Image is for chip family {actual:#x}, system is {expected:#x}")]
    WrongChipFamily {
        /// Running system chip family
        expected: u32,
        /// Chip family declared by the image
        actual: u32,
    },

    /// Declared lengths exceed the buffer
    #[error("Image truncated: declares {declared} bytes, buffer holds {actual}")]
    Truncated {
        /// Declared length
        declared: usize,
        /// Available length
        actual: usize,
    },

    /// TLV record with an impossible length
    #[error("Malformed TLV at offset {offset}: {reason}")]
    MalformedTlv {
        /// Offset of the record
        offset: usize,
        /// What was wrong
        reason: String,
    },

    /// Image built for another board
    #[error("Incompatible target: image is for '{actual}', board is '{expected}'")]
    IncompatibleTarget {
        /// Machine name of the running board
        expected: String,
        /// Machine name in the image
        actual: String,
    },

    /// Image has no kernel record
    #[error("Image has no kernel")]
    NoKernel,

    /// Stage-2 trailer record rejected
    #[error("Invalid stage-2 record: {0}")]
    Stage2(String),
}

impl ImageError {
    /// Helper for malformed TLV records
    #[must_use]
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        ImageError::MalformedTlv {
            offset,
            reason: reason.into(),
        }
    }
}

/// Crate-level firmware error
#[derive(Error, Debug)]
pub enum FirmwareError {
    /// Flash device failure
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Image format failure
    #[error(transparent)]
    Image(#[from] ImageError),

    /// Signature primitive failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Image carries no signature record
    #[error("Image signature missing")]
    SignatureMissing,

    /// Signature did not verify
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Image declares no signature and unsigned images are not allowed
    #[error("Unsigned images are not accepted")]
    UnsignedRejected,

    /// Download slot already in use
    #[error("Firmware download slot is busy")]
    Busy,

    /// Chunk arrived ahead of the next expected chunk
    #[error("Chunk {got} out of order, expected {expected}")]
    ChunkOutOfOrder {
        /// Next expected chunk number
        expected: u32,
        /// Chunk number received
        got: u32,
    },

    /// Commit before all chunks arrived
    #[error("Incomplete upload: {received} of {total} chunks received")]
    IncompleteChunks {
        /// Chunks received
        received: u32,
        /// Declared total
        total: u32,
    },

    /// Write would exceed the download buffer
    #[error("Download exceeds maximum size of {max} bytes ({attempted} requested)")]
    SizeExceeded {
        /// Configured maximum
        max: usize,
        /// Size the write would reach
        attempted: usize,
    },

    /// Session protocol misuse
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Neither partition table copy is valid
    #[error("No valid partition table found")]
    NoValidTable,

    /// Partition table has no entry with this name
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    /// Partition table already has an entry with this name
    #[error("Partition already exists: {0}")]
    PartitionExists(String),

    /// Partition table has no free slot
    #[error("Partition table is full")]
    TableFull,

    /// Image larger than its target region
    #[error("Image of {size} bytes does not fit in {capacity} byte partition")]
    ImageTooLarge {
        /// Bytes to write
        size: u64,
        /// Region capacity
        capacity: u64,
    },

    /// Flash already holds exactly this image
    #[error("Flash already holds this image")]
    SameImage,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error outside the flash layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FirmwareError {
    /// Helper for protocol errors
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        FirmwareError::Protocol(msg.into())
    }

    /// Helper for configuration errors
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        FirmwareError::Config(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FirmwareError::Flash(FlashError::NotFound(_)) => ErrorKind::Configuration,
            FirmwareError::Flash(_) | FirmwareError::SameImage | FirmwareError::Io(_) => {
                ErrorKind::Flash
            }
            FirmwareError::Image(_) => ErrorKind::Format,
            FirmwareError::Crypto(_)
            | FirmwareError::SignatureMissing
            | FirmwareError::AuthenticationFailed(_)
            | FirmwareError::UnsignedRejected => ErrorKind::Authentication,
            FirmwareError::Busy => ErrorKind::ResourceBusy,
            FirmwareError::ChunkOutOfOrder { .. }
            | FirmwareError::IncompleteChunks { .. }
            | FirmwareError::SizeExceeded { .. }
            | FirmwareError::Protocol(_) => ErrorKind::Protocol,
            FirmwareError::NoValidTable
            | FirmwareError::PartitionNotFound(_)
            | FirmwareError::PartitionExists(_)
            | FirmwareError::TableFull
            | FirmwareError::ImageTooLarge { .. }
            | FirmwareError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the caller may retry or re-send
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceBusy | ErrorKind::Protocol)
    }
}

impl From<serde_json::Error> for FirmwareError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareError::Config(e.to_string())
    }
}

/// Result type for firmware operations
pub type FirmwareResult<T> = Result<T, FirmwareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(
            FirmwareError::Image(ImageError::NoKernel).kind(),
            ErrorKind::Format
        );
        assert_eq!(FirmwareError::SignatureMissing.kind(), ErrorKind::Authentication);
        assert_eq!(
            FirmwareError::Flash(FlashError::EraseFailed {
                offset: 0,
                reason: "stuck".to_string()
            })
            .kind(),
            ErrorKind::Flash
        );
        assert_eq!(FirmwareError::Busy.kind(), ErrorKind::ResourceBusy);
        assert_eq!(
            FirmwareError::ChunkOutOfOrder { expected: 2, got: 3 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            FirmwareError::Flash(FlashError::NotFound("linux".to_string())).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_only_busy_and_protocol_are_recoverable() {
        assert!(FirmwareError::Busy.is_recoverable());
        assert!(FirmwareError::protocol("bad").is_recoverable());
        assert!(!FirmwareError::NoValidTable.is_recoverable());
        assert!(!FirmwareError::UnsignedRejected.is_recoverable());
    }
}
