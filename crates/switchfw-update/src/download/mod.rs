//! Download buffer and the single download slot

pub mod buffer;
pub mod manager;

pub use buffer::{ChunkOutcome, FirmwareDownload, StagedImage, UNKNOWN_FILENAME};
pub use manager::{AsyncJob, DownloadManager, SessionId, SlotGuard, SlotStatus};
