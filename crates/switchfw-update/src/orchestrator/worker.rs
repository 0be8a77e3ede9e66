//! Background update worker
//!
//! One long-lived thread takes validated images off the handoff channel and
//! runs the pipeline for each, so request threads never wait on flash.
//! Dropping a job releases the download slot it carried.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::download::AsyncJob;
use crate::error::FirmwareResult;

/// Handle to the update worker thread
#[derive(Debug)]
pub struct UpdateWorker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

fn process(orchestrator: &Orchestrator, job: AsyncJob) {
    let AsyncJob {
        guard,
        image,
        restart,
    } = job;
    info!(
        "Firmware update: {} ({} bytes), lease {}",
        image.filename,
        image.data.len(),
        guard.epoch()
    );
    match orchestrator.update(&image, restart) {
        Ok(report) => debug!("Update finished: {:?}", report),
        Err(e) => warn!("Update of {} stopped: {}", image.filename, e),
    }
    guard.release();
}

fn run(orchestrator: Arc<Orchestrator>, jobs: Receiver<AsyncJob>, stop: Receiver<()>) {
    loop {
        channel::select! {
            recv(jobs) -> job => match job {
                Ok(job) => process(&orchestrator, job),
                Err(e) => {
                    debug!("Handoff channel closed: {}", e);
                    break;
                }
            },
            recv(stop) -> _ => break,
        }
    }
    debug!("Update worker stopped");
}

impl UpdateWorker {
    /// Start the worker on `jobs`
    pub fn spawn(orchestrator: Arc<Orchestrator>, jobs: Receiver<AsyncJob>) -> FirmwareResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded(0);
        let handle = std::thread::Builder::new()
            .name("fw-update-worker".to_string())
            .spawn(move || run(orchestrator, jobs, stop_rx))?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop after the current job and wait for the thread
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Update worker thread panicked");
        }
    }
}

impl Drop for UpdateWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
