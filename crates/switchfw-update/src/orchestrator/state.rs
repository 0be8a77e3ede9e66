//! Update progress states and upload status codes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FirmwareError, FlashError, ImageError};

/// Steps an update passes through, as reported to the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateState {
    /// Another update holds the download slot
    Busy,
    /// Erasing the target partition
    Erasing,
    /// Target partition erased
    Erased,
    /// Programming the target partition
    Programming,
    /// Target partition programmed
    Programmed,
    /// Exchanging active and backup partitions
    Swapping,
    /// Partitions exchanged
    SwapDone,
    /// Partition table commit failed
    SwapFailed,
    /// Program step failed
    ProgramFailed,
    /// Erase step failed
    EraseFailed,
    /// Flash already holds the image
    SameImage,
    /// Image rejected by validation
    InvalidImage,
    /// Target partition does not exist
    UnknownDevice,
    /// Restart requested
    Reboot,
    /// Update finished without a restart
    Done,
}

impl UpdateState {
    /// Text shown to the requester
    pub fn message(self) -> &'static str {
        match self {
            UpdateState::Busy => "Error: Update already in progress",
            UpdateState::Erasing => "Erasing flash...",
            UpdateState::Erased => "Erased flash",
            UpdateState::Programming => "Programming flash...",
            UpdateState::Programmed => "Programmed flash",
            UpdateState::Swapping => "Swapping images...",
            UpdateState::SwapDone => "Swapped active and backup image",
            UpdateState::SwapFailed => "Error: Swapping images failed",
            UpdateState::ProgramFailed => "Error: Programming flash failed",
            UpdateState::EraseFailed => "Error: Erasing flash failed",
            UpdateState::SameImage => "Error: Flash already updated",
            UpdateState::InvalidImage => "Error: Invalid image",
            UpdateState::UnknownDevice => "Error: Firmware flash device not found",
            UpdateState::Reboot => "Restarting, please wait...",
            UpdateState::Done => {
                "Firmware update completed. Restart system to activate new firmware."
            }
        }
    }

    /// Whether this state ends a failed update
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            UpdateState::Busy
                | UpdateState::SwapFailed
                | UpdateState::ProgramFailed
                | UpdateState::EraseFailed
                | UpdateState::SameImage
                | UpdateState::InvalidImage
                | UpdateState::UnknownDevice
        )
    }

    /// State reported when `err` ends an update
    pub fn for_error(err: &FirmwareError) -> Self {
        match err {
            FirmwareError::Busy => UpdateState::Busy,
            FirmwareError::SameImage => UpdateState::SameImage,
            FirmwareError::Flash(FlashError::NotFound(_)) | FirmwareError::PartitionNotFound(_) => {
                UpdateState::UnknownDevice
            }
            FirmwareError::Flash(FlashError::EraseFailed { .. }) => UpdateState::EraseFailed,
            FirmwareError::Flash(_) | FirmwareError::Io(_) | FirmwareError::ImageTooLarge { .. } => {
                UpdateState::ProgramFailed
            }
            FirmwareError::NoValidTable | FirmwareError::TableFull => UpdateState::SwapFailed,
            _ => UpdateState::InvalidImage,
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Result code of an upload as seen by management interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// No upload has run
    #[default]
    None,
    /// Upload finished
    Success,
    /// Image accepted and being installed
    InProgress,
    /// Another upload holds the slot
    Busy,
    /// Image failed validation
    InvalidImage,
    /// Programming flash failed
    WriteFlash,
    /// Erasing flash failed
    EraseFlash,
    /// Flash already holds the image
    SameImage,
    /// Image too large for the buffer or the partition
    ImageSize,
    /// Image built for another board or chip family
    IncompatibleTarget,
    /// Chunk skipped ahead of the next expected one
    ChunkOutOfOrder,
    /// Session misuse
    Protocol,
    /// Installed image or partition layout not understood
    UnknownImage,
    /// Partition to update not found
    FlashEntryNotFound,
}

impl UploadStatus {
    /// Status code for a failed upload
    pub fn from_error(err: &FirmwareError) -> Self {
        match err {
            FirmwareError::Busy => UploadStatus::Busy,
            FirmwareError::Image(
                ImageError::IncompatibleTarget { .. } | ImageError::WrongChipFamily { .. },
            ) => UploadStatus::IncompatibleTarget,
            FirmwareError::Image(_)
            | FirmwareError::Crypto(_)
            | FirmwareError::SignatureMissing
            | FirmwareError::AuthenticationFailed(_)
            | FirmwareError::UnsignedRejected => UploadStatus::InvalidImage,
            FirmwareError::Flash(FlashError::EraseFailed { .. }) => UploadStatus::EraseFlash,
            FirmwareError::Flash(FlashError::NotFound(_)) | FirmwareError::PartitionNotFound(_) => {
                UploadStatus::FlashEntryNotFound
            }
            FirmwareError::Flash(_) | FirmwareError::Io(_) => UploadStatus::WriteFlash,
            FirmwareError::SameImage => UploadStatus::SameImage,
            FirmwareError::ImageTooLarge { .. } | FirmwareError::SizeExceeded { .. } => {
                UploadStatus::ImageSize
            }
            FirmwareError::ChunkOutOfOrder { .. } => UploadStatus::ChunkOutOfOrder,
            FirmwareError::IncompleteChunks { .. } | FirmwareError::Protocol(_) => {
                UploadStatus::Protocol
            }
            FirmwareError::NoValidTable | FirmwareError::Config(_) => UploadStatus::UnknownImage,
            FirmwareError::PartitionExists(_) | FirmwareError::TableFull => {
                UploadStatus::WriteFlash
            }
        }
    }

    /// Status code for an upload outcome
    pub fn from_result<T>(result: &Result<T, FirmwareError>) -> Self {
        match result {
            Ok(_) => UploadStatus::Success,
            Err(e) => Self::from_error(e),
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            UploadStatus::None => "none",
            UploadStatus::Success => "success",
            UploadStatus::InProgress => "in progress",
            UploadStatus::Busy => "busy",
            UploadStatus::InvalidImage => "invalid image",
            UploadStatus::WriteFlash => "flash write failed",
            UploadStatus::EraseFlash => "flash erase failed",
            UploadStatus::SameImage => "same image already in flash",
            UploadStatus::ImageSize => "image size error",
            UploadStatus::IncompatibleTarget => "incompatible target",
            UploadStatus::ChunkOutOfOrder => "chunk out of order",
            UploadStatus::Protocol => "protocol error",
            UploadStatus::UnknownImage => "unknown image",
            UploadStatus::FlashEntryNotFound => "flash entry not found",
        };
        f.write_str(text)
    }
}

/// Snapshot of the most recent update, queryable by asynchronous requesters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// Last state reached
    pub state: Option<UpdateState>,
    /// Result code
    pub upload: UploadStatus,
    /// Human-readable status line
    pub message: String,
    /// Name the image was uploaded under
    pub filename: Option<String>,
    /// When the status last changed
    pub updated_at: DateTime<Utc>,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            state: None,
            upload: UploadStatus::None,
            message: String::new(),
            filename: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_states_carry_error_text() {
        for state in [
            UpdateState::SwapFailed,
            UpdateState::ProgramFailed,
            UpdateState::EraseFailed,
            UpdateState::InvalidImage,
            UpdateState::UnknownDevice,
        ] {
            assert!(state.is_failure());
            assert!(state.message().starts_with("Error:"), "{:?}", state);
        }
        assert!(!UpdateState::Reboot.is_failure());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            UploadStatus::from_error(&FirmwareError::Image(ImageError::WrongChipFamily {
                expected: 1,
                actual: 2
            })),
            UploadStatus::IncompatibleTarget
        );
        assert_eq!(
            UploadStatus::from_error(&FirmwareError::SignatureMissing),
            UploadStatus::InvalidImage
        );
        assert_eq!(
            UploadStatus::from_error(&FirmwareError::ChunkOutOfOrder { expected: 2, got: 4 }),
            UploadStatus::ChunkOutOfOrder
        );
        assert_eq!(
            UploadStatus::from_error(&FirmwareError::Flash(FlashError::NotFound(
                "linux.bk".to_string()
            ))),
            UploadStatus::FlashEntryNotFound
        );
        assert_eq!(
            UploadStatus::from_result::<()>(&Ok(())),
            UploadStatus::Success
        );
    }

    #[test]
    fn test_state_for_error() {
        assert_eq!(
            UpdateState::for_error(&FirmwareError::Flash(FlashError::EraseFailed {
                offset: 0,
                reason: "stuck".to_string()
            })),
            UpdateState::EraseFailed
        );
        assert_eq!(
            UpdateState::for_error(&FirmwareError::UnsignedRejected),
            UpdateState::InvalidImage
        );
    }
}
