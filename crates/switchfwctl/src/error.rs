//! Error types for switchfwctl

use switchfw_update::{ErrorKind, FirmwareError, UploadStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Flash bank not initialized: {0}")]
    NotInitialized(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Firmware error: {0}")]
    Firmware(#[from] FirmwareError),

    #[error("Update failed ({status}): {message}")]
    UpdateFailed {
        status: UploadStatus,
        message: String,
    },

    #[error("Key error: {0}")]
    Key(#[from] switchfw_crypto::CryptoError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::NotInitialized(_) => 2,
            CliError::InvalidArgument(_) | CliError::InvalidConfiguration(_) => 4,
            CliError::Firmware(e) => match e.kind() {
                ErrorKind::Format | ErrorKind::Authentication => 3,
                ErrorKind::Configuration => 4,
                ErrorKind::ResourceBusy => 5,
                ErrorKind::Flash => 6,
                ErrorKind::Protocol => 7,
            },
            CliError::UpdateFailed { status, .. } => match status {
                UploadStatus::InvalidImage
                | UploadStatus::IncompatibleTarget
                | UploadStatus::UnknownImage => 3,
                UploadStatus::ImageSize | UploadStatus::FlashEntryNotFound => 4,
                UploadStatus::Busy => 5,
                UploadStatus::WriteFlash
                | UploadStatus::EraseFlash
                | UploadStatus::SameImage => 6,
                _ => 1,
            },
            CliError::Key(_) => 3,
            CliError::IoError(_) => 1,
        }
    }
}
