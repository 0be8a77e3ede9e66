//! Firmware service facade
//!
//! Wires the download slot, the orchestrator and the background worker
//! together and exposes what request handlers call: the chunked session
//! protocol, whole-buffer uploads, status and image queries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::download::{
    AsyncJob, ChunkOutcome, DownloadManager, FirmwareDownload, SessionId, SlotGuard, SlotStatus,
};
use crate::error::FirmwareResult;
use crate::orchestrator::{
    ImageStatus, Orchestrator, UpdateReport, UpdateStatus, UpdateWorker, UploadStatus,
};
use crate::platform::{Feedback, RestartMode};

/// The firmware update engine
#[derive(Debug)]
pub struct FirmwareService {
    worker: Option<UpdateWorker>,
    downloads: DownloadManager,
    orchestrator: Arc<Orchestrator>,
}

impl FirmwareService {
    /// Start the engine around `orchestrator`
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid configuration, or an I/O
    /// error when a thread cannot be spawned.
    pub fn new(orchestrator: Orchestrator) -> FirmwareResult<Self> {
        orchestrator.config().validate()?;
        let downloads = DownloadManager::new(orchestrator.config())?;
        let orchestrator = Arc::new(orchestrator);
        let worker = UpdateWorker::spawn(Arc::clone(&orchestrator), downloads.receiver())?;
        info!(
            "Firmware service started (primary {}, backup {:?})",
            orchestrator.config().primary_partition,
            orchestrator.config().backup_partition
        );
        Ok(Self {
            worker: Some(worker),
            downloads,
            orchestrator,
        })
    }

    /// The orchestrator
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The download slot
    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Current slot occupancy
    pub fn slot_status(&self) -> SlotStatus {
        self.downloads.slot_status()
    }

    /// Status of the most recent update
    pub fn status(&self) -> UpdateStatus {
        self.orchestrator.status()
    }

    /// Open chunked session `id` for `total_chunks` chunks of `filename`
    pub fn start(
        &self,
        id: SessionId,
        total_chunks: u32,
        filename: &str,
        timeout: Option<Duration>,
    ) -> FirmwareResult<()> {
        self.downloads
            .start_session(id, total_chunks, filename, timeout)?;
        info!("{} started: {} chunks of {}", id, total_chunks, filename);
        Ok(())
    }

    /// Deliver chunk `chunk` of session `id`
    pub fn write(
        &self,
        id: SessionId,
        chunk: u32,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> FirmwareResult<ChunkOutcome> {
        self.downloads.write_chunk(id, chunk, bytes, timeout)
    }

    /// Highest chunk session `id` has delivered
    pub fn get_last_chunk(&self, id: SessionId) -> FirmwareResult<u32> {
        self.downloads.last_chunk(id)
    }

    /// Finish session `id` and hand the image to the worker
    ///
    /// Returns [`UploadStatus::InProgress`] once the image is accepted; the
    /// outcome of the installation is visible through
    /// [`FirmwareService::status`].
    ///
    /// # Errors
    ///
    /// [`crate::FirmwareError::IncompleteChunks`] leaves the session open;
    /// a validation failure ends the session and frees the slot.
    pub fn commit(&self, id: SessionId, restart: Option<RestartMode>) -> FirmwareResult<UploadStatus> {
        let (guard, download) = self.downloads.commit_session(id)?;
        self.hand_off(guard, download, restart)
    }

    /// Drop session `id`
    pub fn abort(&self, id: SessionId) -> FirmwareResult<()> {
        self.downloads.abort_session(id)
    }

    fn load(
        &self,
        data: &[u8],
        filename: &str,
        feedback: Option<Arc<dyn Feedback>>,
    ) -> FirmwareResult<FirmwareDownload> {
        let mut download = self.downloads.new_download()?;
        if let Some(feedback) = feedback {
            download.set_feedback(feedback);
        }
        download.write(data)?;
        download.set_filename(filename);
        Ok(download)
    }

    fn prepare(&self, download: &mut FirmwareDownload) -> FirmwareResult<()> {
        if self.orchestrator.config().stage2_dir.is_none() {
            download.append_filename_tlv()?;
        }
        Ok(())
    }

    fn hand_off(
        &self,
        guard: SlotGuard,
        mut download: FirmwareDownload,
        restart: Option<RestartMode>,
    ) -> FirmwareResult<UploadStatus> {
        self.prepare(&mut download)?;
        let image = download.finish()?;
        if let Err(e) = self.orchestrator.check_image(&image.data) {
            warn!("{} rejected: {}", image.filename, e);
            self.orchestrator
                .record_upload(&image.filename, UploadStatus::from_error(&e), e.to_string());
            if let Some(feedback) = &image.feedback {
                feedback.line(&format!("Error: Invalid image ({})", e));
            }
            guard.release();
            return Err(e);
        }

        // The worker may finish before store_async returns.
        let filename = image.filename.clone();
        self.orchestrator
            .record_upload(&filename, UploadStatus::InProgress, "Image accepted");
        if let Err(e) = self.downloads.store_async(AsyncJob {
            guard,
            image,
            restart,
        }) {
            self.orchestrator
                .record_upload(&filename, UploadStatus::from_error(&e), e.to_string());
            return Err(e);
        }
        debug!("{} queued for installation", filename);
        Ok(UploadStatus::InProgress)
    }

    /// Validate `data` and install it in the background
    ///
    /// # Errors
    ///
    /// [`crate::FirmwareError::Busy`] when the slot is taken, or the
    /// validation failure.
    pub fn update_async(
        &self,
        data: &[u8],
        filename: &str,
        restart: Option<RestartMode>,
        feedback: Option<Arc<dyn Feedback>>,
    ) -> FirmwareResult<UploadStatus> {
        let guard = self.downloads.acquire()?;
        let download = self.load(data, filename, feedback)?;
        self.hand_off(guard, download, restart)
    }

    /// Install `data` on the calling thread
    pub fn update_sync(
        &self,
        data: &[u8],
        filename: &str,
        restart: Option<RestartMode>,
        feedback: Option<Arc<dyn Feedback>>,
    ) -> FirmwareResult<UpdateReport> {
        let guard = self.downloads.acquire()?;
        let mut download = self.load(data, filename, feedback)?;
        self.prepare(&mut download)?;
        let image = download.finish()?;
        let report = self.orchestrator.update(&image, restart);
        guard.release();
        report
    }

    /// Make the backup image the one booted next
    pub fn swap_images(&self) -> FirmwareResult<()> {
        let _guard = self.downloads.acquire()?;
        self.orchestrator.swap_images()
    }

    /// Details of the image installed in partition `name`
    pub fn image_status(&self, name: &str) -> FirmwareResult<ImageStatus> {
        self.orchestrator.image_status(name)
    }

    /// Wait up to `timeout` for background work to finish
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.downloads.wait_free(timeout)
    }

    /// Stop the worker after its current job
    pub fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        info!("Firmware service stopped");
    }
}
