//! Firmware update engine for switch control planes
//!
//! This crate takes a firmware image from an upload, authenticates it and
//! commits it to flash without ever leaving the system unbootable:
//! - Bounds-checked parsing of the image header, TLV stream and stage-2 trailer
//! - MD5 / SHA-256 / SHA-512 image signatures checked against an installed key
//! - A/B image partitions selected through a redundant partition table pair
//! - One download slot shared by every upload path, with chunked sessions
//! - A background worker that runs the update pipeline off request threads
//!
//! # Architecture
//!
//! - [`flash`]: Named flash regions and the erase/program discipline
//! - [`image`]: Image format, builder and validator
//! - [`sideband`]: Metadata record stored after an installed image
//! - [`fis`]: Redundant partition descriptor tables
//! - [`download`]: Download buffer, download slot and chunked sessions
//! - [`orchestrator`]: Update pipeline, progress states and the worker
//! - [`service`]: Facade used by request handlers
//! - [`tlv`]: Bounds-checked TLV records shared by the image and sideband
//! - [`platform`]: Collaborators supplied by the host
//! - [`config`]: Configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchfw_update::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bank = SimFlashBank::new();
//! bank.add_partition("FIS_directory", 4096, 4096);
//! bank.add_partition("Redundant_FIS", 4096, 4096);
//! bank.add_partition("linux", 64 * 1024, 4096);
//!
//! let config = FirmwareConfig::builder()
//!     .backup_partition(None)
//!     .soc_family(0x7468)
//!     .build()?;
//! let orchestrator = Orchestrator::new(config, Arc::new(bank), Arc::new(StaticKeyProvider::new()));
//!
//! let image = ImageBuilder::new("demo", 0x7468).kernel(vec![0u8; 1024]).build()?;
//! let info = orchestrator.check_image(&image)?;
//! assert_eq!(info.header.machine_name(), "demo");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod download;
pub mod error;
pub mod fis;
pub mod flash;
pub mod image;
pub mod orchestrator;
pub mod platform;
pub mod prelude;
pub mod service;
pub mod sideband;
pub mod tlv;

pub use config::{FirmwareConfig, FirmwareConfigBuilder, SystemIdentity};
pub use download::{
    AsyncJob, ChunkOutcome, DownloadManager, FirmwareDownload, SessionId, SlotGuard, SlotStatus,
    StagedImage,
};
pub use error::{ErrorKind, FirmwareError, FirmwareResult, FlashError, ImageError};
pub use fis::{FisDescriptor, FisManager, FisTable};
pub use flash::{FileFlashBank, FlashDevice, FlashHandle, FlashProvider, SimFlashBank};
pub use image::{ImageBuilder, ImageHeader, ImageInfo, ImageValidator, Stage2Record, TlvType};
pub use orchestrator::{
    BootloaderAction, ImageStatus, Orchestrator, UpdateReport, UpdateState, UpdateStatus,
    UpdateWorker, UploadStatus,
};
pub use platform::{
    ActiveImage, Feedback, FixedActiveImage, LineBuffer, LogFeedback, RestartLog, RestartMode,
    RestartRequester,
};
pub use service::FirmwareService;
pub use sideband::SidebandRecord;
pub use tlv::{TLV_ALIGN, TLV_HEADER_SIZE, TlvView};
