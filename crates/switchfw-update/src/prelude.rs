//! Convenience re-exports for common firmware update types

pub use crate::config::{FirmwareConfig, FirmwareConfigBuilder, SystemIdentity};
pub use crate::download::{ChunkOutcome, SessionId, SlotStatus};
pub use crate::error::{ErrorKind, FirmwareError, FirmwareResult};
pub use crate::fis::{FisDescriptor, FisManager};
pub use crate::flash::{FileFlashBank, FlashHandle, FlashProvider, SimFlashBank};
pub use crate::image::{ImageBuilder, ImageHeader, ImageInfo, ImageValidator, Stage2Record, TlvType};
pub use crate::orchestrator::{
    BootloaderAction, ImageStatus, Orchestrator, UpdateReport, UpdateState, UpdateStatus,
    UploadStatus,
};
pub use crate::platform::{
    ActiveImage, Feedback, FixedActiveImage, LineBuffer, RestartLog, RestartMode,
};
pub use crate::service::FirmwareService;
pub use crate::sideband::SidebandRecord;
pub use switchfw_crypto::{KeyPair, KeyProvider, SignatureType, StaticKeyProvider};
