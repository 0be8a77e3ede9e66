//! The single download slot
//!
//! Every path that wants to program flash first takes the slot. It is never
//! queued for: a taker that finds it occupied gets [`FirmwareError::Busy`]
//! immediately.
//!
//! ```text
//!            acquire()                       guard dropped
//!   Free ─────────────────▶ InUseSync ───────────────────────▶ Free
//!     │                                                          ▲
//!     │ acquire_for_session()        abort / idle timeout        │
//!     └──────────────────▶ InUseAsync ───────────────────────────┤
//!                              │ commit_session()                │
//!                              └──▶ handoff ──▶ worker done ─────┘
//! ```
//!
//! Ownership is tracked with an epoch that changes on every acquisition, so a
//! guard outliving its lease (for instance after an idle timeout freed the
//! slot and someone else took it) can never release the new owner's slot.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::buffer::{ChunkOutcome, FirmwareDownload, StagedImage};
use crate::config::FirmwareConfig;
use crate::error::{FirmwareError, FirmwareResult};
use crate::platform::RestartMode;

/// Occupancy of the download slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Nobody holds the slot
    Free,
    /// Held by a caller that releases it when its guard drops
    InUseSync,
    /// Held by a chunked session or an update handed to the worker
    InUseAsync,
}

/// Caller-chosen identifier of a chunked upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {}", self.0)
    }
}

#[derive(Debug)]
struct SlotState {
    status: SlotStatus,
    epoch: u64,
    session: Option<SessionId>,
    download: Option<FirmwareDownload>,
    /// Idle deadline and the lease it was armed for
    deadline: Option<(Instant, u64)>,
    shutdown: bool,
}

impl SlotState {
    fn release(&mut self) {
        self.status = SlotStatus::Free;
        self.session = None;
        self.download = None;
        self.deadline = None;
    }

    fn take(&mut self, status: SlotStatus) -> u64 {
        self.status = status;
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    fn arm(&mut self, timeout: Duration) {
        self.deadline = Some((Instant::now() + timeout, self.epoch));
    }

    fn check_owner(&self, id: SessionId) -> FirmwareResult<()> {
        match (self.status, self.session) {
            (SlotStatus::InUseAsync, Some(owner)) if owner == id => Ok(()),
            (SlotStatus::Free, _) => Err(FirmwareError::protocol(format!("{} is not active", id))),
            _ => Err(FirmwareError::Busy),
        }
    }

    fn session_download(&mut self, id: SessionId) -> FirmwareResult<&mut FirmwareDownload> {
        self.check_owner(id)?;
        self.download
            .as_mut()
            .ok_or_else(|| FirmwareError::protocol(format!("{} has no download", id)))
    }

    /// Whether the armed deadline still belongs to a live session lease
    fn session_expired(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.status == SlotStatus::InUseAsync && self.session.is_some()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SlotState>,
    timer: Condvar,
    freed: Condvar,
    max_download_size: usize,
    staging_dir: Option<PathBuf>,
    default_timeout: Duration,
}

impl Shared {
    fn new_download(&self) -> FirmwareResult<FirmwareDownload> {
        match &self.staging_dir {
            Some(dir) => FirmwareDownload::in_dir(dir, self.max_download_size),
            None => Ok(FirmwareDownload::new(self.max_download_size)),
        }
    }

    fn release_if_current(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.status == SlotStatus::Free {
            return false;
        }
        state.release();
        drop(state);
        self.timer.notify_all();
        self.freed.notify_all();
        true
    }
}

/// Lease on the download slot; dropping it frees the slot
#[derive(Debug)]
pub struct SlotGuard {
    shared: Arc<Shared>,
    epoch: u64,
}

impl SlotGuard {
    /// Lease number this guard holds
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Free the slot now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.shared.release_if_current(self.epoch) {
            debug!("Download slot released (lease {})", self.epoch);
        } else {
            trace!("Lease {} already ended", self.epoch);
        }
    }
}

/// A validated image handed to the background worker
#[derive(Debug)]
pub struct AsyncJob {
    /// Slot lease, released when the job is dropped
    pub guard: SlotGuard,
    /// Image to install
    pub image: StagedImage,
    /// Restart to request after a successful update
    pub restart: Option<RestartMode>,
}

/// Owner of the download slot, the session idle timer and the worker handoff
pub struct DownloadManager {
    shared: Arc<Shared>,
    handoff_tx: Sender<AsyncJob>,
    handoff_rx: Receiver<AsyncJob>,
    timer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("status", &self.slot_status())
            .field("session", &self.session_id())
            .finish_non_exhaustive()
    }
}

fn run_timer(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.deadline {
            None => shared.timer.wait(&mut state),
            Some((deadline, epoch)) if Instant::now() >= deadline => {
                if !state.session_expired(epoch) {
                    trace!("Dropping idle deadline of lease {}", epoch);
                    state.deadline = None;
                    continue;
                }
                info!(
                    "Upload {} idle too long, discarding {} bytes",
                    state
                        .session
                        .map_or_else(|| "session".to_string(), |s| s.to_string()),
                    state.download.as_ref().map_or(0, FirmwareDownload::len)
                );
                state.release();
                shared.freed.notify_all();
            }
            Some((deadline, _)) => {
                if shared.timer.wait_until(&mut state, deadline).timed_out() {
                    trace!("Session idle deadline reached");
                }
            }
        }
    }
    trace!("Session timer stopped");
}

impl DownloadManager {
    /// Create the slot and start its idle timer
    pub fn new(config: &FirmwareConfig) -> FirmwareResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SlotState {
                status: SlotStatus::Free,
                epoch: 0,
                session: None,
                download: None,
                deadline: None,
                shutdown: false,
            }),
            timer: Condvar::new(),
            freed: Condvar::new(),
            max_download_size: config.max_download_size,
            staging_dir: config.staging_dir.clone(),
            default_timeout: config.session_timeout,
        });
        let timer_shared = Arc::clone(&shared);
        let timer = std::thread::Builder::new()
            .name("fw-session-timer".to_string())
            .spawn(move || run_timer(timer_shared))?;
        let (handoff_tx, handoff_rx) = channel::bounded(1);
        Ok(Self {
            shared,
            handoff_tx,
            handoff_rx,
            timer: Some(timer),
        })
    }

    /// Current slot occupancy
    pub fn slot_status(&self) -> SlotStatus {
        self.shared.state.lock().status
    }

    /// Session that owns the slot, if any
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.state.lock().session
    }

    /// Empty download honouring the configured size limit and staging
    pub fn new_download(&self) -> FirmwareResult<FirmwareDownload> {
        self.shared.new_download()
    }

    /// Take the slot for a caller that holds it for one call
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::Busy`] when the slot is occupied.
    pub fn acquire(&self) -> FirmwareResult<SlotGuard> {
        let mut state = self.shared.state.lock();
        if state.status != SlotStatus::Free {
            debug!("Slot busy ({:?})", state.status);
            return Err(FirmwareError::Busy);
        }
        let epoch = state.take(SlotStatus::InUseSync);
        debug!("Download slot taken (lease {})", epoch);
        Ok(SlotGuard {
            shared: Arc::clone(&self.shared),
            epoch,
        })
    }

    /// Take the slot for session `id`, or re-enter it when `id` already owns
    /// it; arms the idle timer either way
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::Busy`] when another owner holds the slot.
    pub fn acquire_for_session(
        &self,
        id: SessionId,
        timeout: Option<Duration>,
    ) -> FirmwareResult<()> {
        let timeout = timeout.unwrap_or(self.shared.default_timeout);
        let mut state = self.shared.state.lock();
        match (state.status, state.session) {
            (SlotStatus::Free, _) => {
                let download = self.shared.new_download()?;
                let epoch = state.take(SlotStatus::InUseAsync);
                state.session = Some(id);
                state.download = Some(download);
                debug!("Slot taken by {} (lease {})", id, epoch);
            }
            (SlotStatus::InUseAsync, Some(owner)) if owner == id => {
                trace!("{} re-entered the slot", id);
            }
            _ => return Err(FirmwareError::Busy),
        }
        state.arm(timeout);
        drop(state);
        self.shared.timer.notify_all();
        Ok(())
    }

    /// Start session `id` expecting `total_chunks` chunks of `filename`
    pub fn start_session(
        &self,
        id: SessionId,
        total_chunks: u32,
        filename: &str,
        timeout: Option<Duration>,
    ) -> FirmwareResult<()> {
        if total_chunks == 0 {
            return Err(FirmwareError::protocol("session must declare at least one chunk"));
        }
        self.acquire_for_session(id, timeout)?;
        self.with_session(id, |download| {
            if download.total_chunks() == 0 {
                download.set_total_chunks(total_chunks)?;
                download.set_filename(filename);
            } else if download.total_chunks() != total_chunks {
                return Err(FirmwareError::protocol(format!(
                    "{} already declared {} chunks",
                    id,
                    download.total_chunks()
                )));
            }
            Ok(())
        })
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut FirmwareDownload) -> FirmwareResult<T>,
    ) -> FirmwareResult<T> {
        let mut state = self.shared.state.lock();
        f(state.session_download(id)?)
    }

    /// Append chunk `n` to session `id`
    ///
    /// An accepted chunk rearms the idle timer; a repeated chunk is ignored.
    pub fn write_chunk(
        &self,
        id: SessionId,
        n: u32,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> FirmwareResult<ChunkOutcome> {
        let timeout = timeout.unwrap_or(self.shared.default_timeout);
        let mut state = self.shared.state.lock();
        let outcome = state.session_download(id)?.accept_chunk(n, bytes)?;
        if outcome == ChunkOutcome::Accepted {
            state.arm(timeout);
            drop(state);
            self.shared.timer.notify_all();
            trace!("{} accepted chunk {} ({} bytes)", id, n, bytes.len());
        }
        Ok(outcome)
    }

    /// Highest chunk number session `id` has delivered
    pub fn last_chunk(&self, id: SessionId) -> FirmwareResult<u32> {
        self.with_session(id, |download| Ok(download.last_received_chunk()))
    }

    /// Drop session `id` and free the slot
    pub fn abort_session(&self, id: SessionId) -> FirmwareResult<()> {
        let mut state = self.shared.state.lock();
        state.check_owner(id)?;
        state.release();
        drop(state);
        self.shared.timer.notify_all();
        self.shared.freed.notify_all();
        info!("{} aborted", id);
        Ok(())
    }

    /// End the upload phase of session `id`
    ///
    /// The session association and idle timer are cleared; the slot stays
    /// occupied under the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::IncompleteChunks`] while chunks are missing;
    /// the session stays open in that case.
    pub fn commit_session(&self, id: SessionId) -> FirmwareResult<(SlotGuard, FirmwareDownload)> {
        let mut state = self.shared.state.lock();
        let pending = state.session_download(id)?;
        if !pending.is_complete() {
            return Err(FirmwareError::IncompleteChunks {
                received: pending.last_received_chunk(),
                total: pending.total_chunks(),
            });
        }
        let download = state
            .download
            .take()
            .ok_or_else(|| FirmwareError::protocol(format!("{} has no download", id)))?;
        state.session = None;
        state.deadline = None;
        let epoch = state.epoch;
        drop(state);
        self.shared.timer.notify_all();
        debug!("{} committed {} bytes", id, download.len());
        Ok((
            SlotGuard {
                shared: Arc::clone(&self.shared),
                epoch,
            },
            download,
        ))
    }

    /// Hand a validated image to the background worker
    ///
    /// The slot stays occupied until the worker drops the job.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareError::Busy`] when a previous handoff is still
    /// unconsumed; the job's lease is released in that case.
    pub fn store_async(&self, job: AsyncJob) -> FirmwareResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.epoch == job.guard.epoch && state.status != SlotStatus::Free {
                state.status = SlotStatus::InUseAsync;
            }
        }
        match self.handoff_tx.try_send(job) {
            Ok(()) => {
                debug!("Image handed to the update worker");
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                warn!("Update worker still has a pending image");
                drop(job);
                Err(FirmwareError::Busy)
            }
            Err(TrySendError::Disconnected(job)) => {
                drop(job);
                Err(FirmwareError::protocol("update worker is gone"))
            }
        }
    }

    /// Block until an image is handed off; `None` once the manager is gone
    pub fn get_async(&self) -> Option<AsyncJob> {
        self.handoff_rx.recv().ok()
    }

    /// Receiving end of the handoff, for a worker thread
    pub fn receiver(&self) -> Receiver<AsyncJob> {
        self.handoff_rx.clone()
    }

    /// Wait up to `timeout` for the slot to become free
    pub fn wait_free(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.status != SlotStatus::Free {
            if self.shared.freed.wait_until(&mut state, deadline).timed_out() {
                return state.status == SlotStatus::Free;
            }
        }
        true
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.timer.notify_all();
        if let Some(timer) = self.timer.take()
            && timer.join().is_err()
        {
            warn!("Session timer thread panicked");
        }
    }
}
