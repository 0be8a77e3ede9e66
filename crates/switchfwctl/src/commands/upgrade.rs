//! Image installation and boot image selection

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use switchfw_update::{Feedback, LineBuffer, RestartMode, UploadStatus};

use crate::commands::read_file;
use crate::engine::{Engine, EngineArgs};
use crate::error::CliError;
use crate::output::{self, ConsoleFeedback};

/// How long a background install may take
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

fn upload_name(path: &Path, filename: Option<&str>) -> String {
    match filename {
        Some(name) => name.to_string(),
        None => path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
    }
}

/// Install the image at `path` into the standby partition
pub fn upgrade(
    path: &Path,
    filename: Option<&str>,
    restart: Option<RestartMode>,
    background: bool,
    args: &EngineArgs,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(args)?;
    let data = read_file(path)?;
    let name = upload_name(path, filename);
    let service = engine.service()?;

    let lines = Arc::new(LineBuffer::new());
    let feedback: Arc<dyn Feedback> = if json {
        Arc::clone(&lines) as Arc<dyn Feedback>
    } else {
        Arc::new(ConsoleFeedback)
    };

    if background {
        service
            .update_async(&data, &name, restart, Some(feedback))
            .map_err(CliError::from)?;
        if !service.wait_idle(INSTALL_TIMEOUT) {
            return Err(CliError::UpdateFailed {
                status: UploadStatus::InProgress,
                message: format!("{} still installing after {:?}", name, INSTALL_TIMEOUT),
            }
            .into());
        }
        let status = service.status();
        service.shutdown();
        if status.upload != UploadStatus::Success {
            return Err(CliError::UpdateFailed {
                status: status.upload,
                message: status.message,
            }
            .into());
        }
        output::print_update_status(&status, &lines.lines(), json);
        return Ok(());
    }

    let report = service
        .update_sync(&data, &name, restart, Some(feedback))
        .map_err(CliError::from)?;
    service.shutdown();
    output::print_report(&report, &lines.lines(), json);
    Ok(())
}

/// Make the backup image the one booted next
pub fn swap(args: &EngineArgs, json: bool) -> Result<()> {
    let engine = Engine::open(args)?;
    let service = engine.service()?;
    service.swap_images().map_err(CliError::from)?;
    let orchestrator = service.orchestrator();
    let primary = orchestrator.config().primary_partition.clone();
    let backup = orchestrator.config().backup_partition.clone().unwrap_or_default();
    service.shutdown();
    output::print_swap(&primary, &backup, json);
    Ok(())
}
