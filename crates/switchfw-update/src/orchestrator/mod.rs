//! Update pipeline
//!
//! An accepted image is installed in a fixed order, and no step is skipped
//! on the success path:
//!
//! 1. validate structure, board, signature and stage-2 records
//! 2. erase the target partition
//! 3. program it, payload first and header block last
//! 4. write the sideband record after the image
//! 5. flash the stage-2 bootloader, when present and different
//! 6. commit the partition table when the backup slot was written
//! 7. request a restart
//!
//! A failure after step 2 is reported and left for the operator; nothing is
//! rolled back. Steps 2 to 5 only ever touch the inactive partition.

pub mod state;
pub mod worker;

pub use state::{UpdateState, UpdateStatus, UploadStatus};
pub use worker::UpdateWorker;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use switchfw_crypto::KeyProvider;
use tracing::{debug, error, info, warn};

use crate::config::FirmwareConfig;
use crate::download::StagedImage;
use crate::error::{FirmwareError, FirmwareResult, ImageError};
use crate::fis::FisManager;
use crate::flash::{FlashHandle, FlashProvider};
use crate::image::{
    ImageHeader, ImageInfo, ImageValidator, STAGE2_HEADER_SIZE, STAGE2_MAGIC, TlvType,
    find_tlv_in_flash, read_header_from_flash,
};
use crate::platform::{
    ActiveImage, Feedback, FixedActiveImage, RestartLog, RestartMode, RestartRequester,
};
use crate::sideband::SidebandRecord;
use crate::tlv::le_u32;

/// What happened to the stage-2 bootloader during an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootloaderAction {
    /// Image carried no bootloader record
    Absent,
    /// Bootloader partition already held the record
    Unchanged,
    /// Bootloader partition rewritten
    Flashed,
}

/// Outcome of a completed update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Partition that was written
    pub partition: String,
    /// Bytes programmed into it
    pub bytes_written: u64,
    /// Persisted stage-2 trailer, if any
    pub stage2_file: Option<String>,
    /// Bootloader step outcome
    pub bootloader: BootloaderAction,
    /// Whether the partition table was committed to swap images
    pub swapped: bool,
    /// Restart that was requested
    pub restart: Option<RestartMode>,
}

/// Description of an installed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    /// Partition holding the image
    pub partition: String,
    /// Whether the system runs from this partition
    pub active: bool,
    /// Target machine name
    pub machine: String,
    /// SoC name
    pub soc_name: String,
    /// SoC identifier
    pub soc_id: u32,
    /// Stage-1 image length
    pub image_len: u32,
    /// Signature scheme tag
    pub signature_type: u32,
    /// Name the image was uploaded under
    pub filename: Option<String>,
    /// Persisted stage-2 trailer
    pub stage2_filename: Option<String>,
    /// Metadata record of the image
    pub metadata: Option<String>,
}

fn say(feedback: Option<&Arc<dyn Feedback>>, text: &str) {
    if let Some(feedback) = feedback {
        feedback.line(text);
    }
}

fn trimmed_text(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(data.get(..end).unwrap_or_default()).into_owned()
}

/// Length of the installed image including any stage-2 records stored
/// behind it
fn installed_length(handle: &mut FlashHandle, header: &ImageHeader) -> FirmwareResult<u64> {
    let size = handle.size();
    let mut end = u64::from(header.image_len);
    let mut record = [0u8; STAGE2_HEADER_SIZE];
    while end.saturating_add(STAGE2_HEADER_SIZE as u64) <= size {
        handle.read_at(end, &mut record)?;
        let (Some(magic), Some(tlv_len)) = (le_u32(&record, 0), le_u32(&record, 8)) else {
            break;
        };
        if magic != STAGE2_MAGIC || (tlv_len as usize) < STAGE2_HEADER_SIZE {
            break;
        }
        let next = end.saturating_add(u64::from(tlv_len));
        if next > size {
            break;
        }
        end = next;
    }
    Ok(end)
}

/// Runs the update pipeline against a set of flash partitions
pub struct Orchestrator {
    config: FirmwareConfig,
    provider: Arc<dyn FlashProvider>,
    validator: ImageValidator,
    tables: FisManager,
    active: Arc<dyn ActiveImage>,
    restart: Arc<dyn RestartRequester>,
    status: Mutex<UpdateStatus>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("primary", &self.config.primary_partition)
            .field("backup", &self.config.backup_partition)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator over the partitions of `provider`, verifying images with
    /// keys from `keys`
    ///
    /// The active partition is reported unknown and restarts are only logged
    /// until the host supplies its own collaborators.
    pub fn new(
        config: FirmwareConfig,
        provider: Arc<dyn FlashProvider>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        let validator = ImageValidator::new(keys, &config);
        let tables = FisManager::new(
            Arc::clone(&provider),
            config.primary_table.clone(),
            config.redundant_table.clone(),
        );
        Self {
            config,
            provider,
            validator,
            tables,
            active: Arc::new(FixedActiveImage::unknown()),
            restart: Arc::new(RestartLog::new()),
            status: Mutex::new(UpdateStatus::default()),
        }
    }

    /// Use `active` to learn which partition the system runs from
    #[must_use]
    pub fn with_active_image(mut self, active: Arc<dyn ActiveImage>) -> Self {
        self.active = active;
        self
    }

    /// Use `restart` to restart the system after an update
    #[must_use]
    pub fn with_restart(mut self, restart: Arc<dyn RestartRequester>) -> Self {
        self.restart = restart;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &FirmwareConfig {
        &self.config
    }

    /// Image validator in use
    pub fn validator(&self) -> &ImageValidator {
        &self.validator
    }

    /// Partition table manager
    pub fn tables(&self) -> &FisManager {
        &self.tables
    }

    /// Partition the system runs from; the primary when unknown
    pub fn active_partition(&self) -> String {
        self.active
            .active_partition()
            .unwrap_or_else(|| self.config.primary_partition.clone())
    }

    /// Partition an update writes to: the backup when it is configured,
    /// present and not running, else the primary
    pub fn target_partition(&self) -> String {
        let active = self.active_partition();
        match &self.config.backup_partition {
            Some(backup) if *backup != active && self.provider.exists(backup) => backup.clone(),
            _ => self.config.primary_partition.clone(),
        }
    }

    /// Firmware partitions this system knows about
    pub fn image_partitions(&self) -> Vec<String> {
        let mut names = vec![self.config.primary_partition.clone()];
        names.extend(self.config.backup_partition.iter().cloned());
        names
    }

    fn board_machine(&self) -> Option<String> {
        if let Some(machine) = &self.config.system.machine {
            return Some(machine.clone());
        }
        let active = self.active_partition();
        let header = FlashHandle::open(self.provider.as_ref(), &active)
            .map_err(FirmwareError::from)
            .and_then(|mut handle| read_header_from_flash(&mut handle));
        match header {
            Ok(header) => Some(header.machine_name()),
            Err(e) => {
                debug!("No installed image in {} ({}), any board matches", active, e);
                None
            }
        }
    }

    /// Full acceptance check of `data` against this system
    ///
    /// # Errors
    ///
    /// Format, compatibility and authentication failures from
    /// [`ImageValidator::check_image`].
    pub fn check_image(&self, data: &[u8]) -> FirmwareResult<ImageInfo> {
        let machine = self.board_machine();
        self.validator.check_image(data, machine.as_deref())
    }

    /// Status of the most recent update
    pub fn status(&self) -> UpdateStatus {
        self.status.lock().clone()
    }

    fn set_state(&self, state: UpdateState, feedback: Option<&Arc<dyn Feedback>>) {
        if state.is_failure() {
            warn!("{}", state);
        } else {
            info!("{}", state);
        }
        say(feedback, state.message());
        let mut status = self.status.lock();
        status.state = Some(state);
        status.message = state.message().to_string();
        status.updated_at = Utc::now();
    }

    pub(crate) fn record_upload(
        &self,
        filename: &str,
        upload: UploadStatus,
        message: impl Into<String>,
    ) {
        let mut status = self.status.lock();
        *status = UpdateStatus {
            state: None,
            upload,
            message: message.into(),
            filename: Some(filename.to_string()),
            updated_at: Utc::now(),
        };
    }

    /// Install `image`
    ///
    /// The caller must hold the download slot for the whole call.
    ///
    /// # Errors
    ///
    /// The first failing step's error; the status reflects the step that
    /// failed.
    pub fn update(
        &self,
        image: &StagedImage,
        restart: Option<RestartMode>,
    ) -> FirmwareResult<UpdateReport> {
        let feedback = image.feedback.as_ref();
        self.record_upload(
            &image.filename,
            UploadStatus::InProgress,
            "Starting flash update",
        );
        say(feedback, "Starting flash update - do not power off device!");

        let result = self.install(image, feedback);
        if self.config.stage2_dir.is_some()
            && let Err(e) = self.cleanup_stage2()
        {
            warn!("Stage-2 cleanup failed: {}", e);
        }

        let result = result.and_then(|mut report| match restart {
            Some(mode) => {
                self.set_state(UpdateState::Reboot, feedback);
                report.restart = Some(mode);
                self.restart.request_restart(mode).map(|()| report)
            }
            None => {
                self.set_state(UpdateState::Done, feedback);
                Ok(report)
            }
        });

        let upload = UploadStatus::from_result(&result);
        match &result {
            Ok(report) => info!(
                "Installed {} in {} ({} bytes)",
                image.filename, report.partition, report.bytes_written
            ),
            Err(e) => {
                error!("Firmware update with {} failed: {}", image.filename, e);
                let failed = self.status.lock().state.is_some_and(UpdateState::is_failure);
                if !failed {
                    self.set_state(UpdateState::for_error(e), feedback);
                }
            }
        }
        let mut status = self.status.lock();
        status.upload = upload;
        status.updated_at = Utc::now();
        drop(status);
        result
    }

    fn install(
        &self,
        image: &StagedImage,
        feedback: Option<&Arc<dyn Feedback>>,
    ) -> FirmwareResult<UpdateReport> {
        let info = self.check_image(&image.data).inspect_err(|e| {
            warn!("Rejecting {}: {}", image.filename, e);
            self.set_state(UpdateState::InvalidImage, feedback);
        })?;

        let target = self.target_partition();
        info!(
            "Updating {} with {} ({} bytes)",
            target,
            image.filename,
            image.data.len()
        );

        let stage1 = image.data.get(..info.stage1_len).unwrap_or_default();
        let trailer = image.data.get(info.stage1_len..).unwrap_or_default();

        let mut sideband = SidebandRecord::new();
        sideband.set_filename(&image.filename);
        let (payload, stage2_file) = match &self.config.stage2_dir {
            Some(dir) => {
                let stage2_file = if trailer.is_empty() {
                    None
                } else {
                    let name = self.persist_stage2(dir, trailer).inspect_err(|_| {
                        self.set_state(UpdateState::ProgramFailed, feedback);
                    })?;
                    sideband.set_stage2_filename(&name);
                    Some(name)
                };
                (stage1, stage2_file)
            }
            None => (image.data.as_slice(), None),
        };

        let bytes_written = self.program_image(&target, payload, &sideband, feedback)?;
        let bootloader = self.update_bootloader(&info, trailer, feedback)?;

        let swapped = match &self.config.backup_partition {
            Some(backup) if *backup == target => {
                self.set_state(UpdateState::Swapping, feedback);
                self.tables
                    .swap_active(&self.config.primary_partition, backup)
                    .inspect_err(|_| self.set_state(UpdateState::SwapFailed, feedback))?;
                self.set_state(UpdateState::SwapDone, feedback);
                true
            }
            _ => false,
        };

        Ok(UpdateReport {
            partition: target,
            bytes_written,
            stage2_file,
            bootloader,
            swapped,
            restart: None,
        })
    }

    fn program_image(
        &self,
        target: &str,
        payload: &[u8],
        sideband: &SidebandRecord,
        feedback: Option<&Arc<dyn Feedback>>,
    ) -> FirmwareResult<u64> {
        let mut handle = FlashHandle::open(self.provider.as_ref(), target)
            .inspect_err(|_| self.set_state(UpdateState::UnknownDevice, feedback))?;
        let length = payload.len() as u64;
        if length > handle.size() {
            self.set_state(UpdateState::ProgramFailed, feedback);
            return Err(FirmwareError::ImageTooLarge {
                size: length,
                capacity: handle.size(),
            });
        }

        self.set_state(UpdateState::Erasing, feedback);
        handle
            .erase(length)
            .inspect_err(|_| self.set_state(UpdateState::EraseFailed, feedback))?;
        self.set_state(UpdateState::Erased, feedback);

        self.set_state(UpdateState::Programming, feedback);
        handle
            .program(payload)
            .inspect_err(|_| self.set_state(UpdateState::ProgramFailed, feedback))?;

        let offset = SidebandRecord::offset_for(&handle, length);
        if offset.saturating_add(sideband.length() as u64) <= handle.size() {
            sideband
                .write(&mut handle, offset)
                .inspect_err(|_| self.set_state(UpdateState::ProgramFailed, feedback))?;
        } else {
            warn!("No room for sideband in {} at {:#x}", target, offset);
        }
        handle.close();
        self.set_state(UpdateState::Programmed, feedback);
        Ok(length)
    }

    fn update_bootloader(
        &self,
        info: &ImageInfo,
        trailer: &[u8],
        feedback: Option<&Arc<dyn Feedback>>,
    ) -> FirmwareResult<BootloaderAction> {
        let Some(record) = info.bootloader() else {
            return Ok(BootloaderAction::Absent);
        };
        let data = record.data(trailer);
        if data.is_empty() {
            self.set_state(UpdateState::InvalidImage, feedback);
            return Err(ImageError::Stage2(format!(
                "empty bootloader record at offset {}",
                record.offset
            ))
            .into());
        }
        debug!("Stage-2 bootloader update, {} bytes", data.len());
        let written =
            self.flash_partition_if_needed(&self.config.bootloader_partition, data, feedback)?;
        Ok(if written {
            BootloaderAction::Flashed
        } else {
            BootloaderAction::Unchanged
        })
    }

    /// Erase and program partition `name` with `data`
    ///
    /// # Errors
    ///
    /// [`FirmwareError::ImageTooLarge`] when `data` does not fit and
    /// [`FirmwareError::SameImage`] when the partition already holds it.
    pub fn flash_partition(
        &self,
        name: &str,
        data: &[u8],
        feedback: Option<&Arc<dyn Feedback>>,
    ) -> FirmwareResult<()> {
        let mut handle = FlashHandle::open(self.provider.as_ref(), name)?;
        let length = data.len() as u64;
        if length > handle.size() {
            debug!(
                "Image too big for {}: {} > {}",
                name,
                length,
                handle.size()
            );
            return Err(FirmwareError::ImageTooLarge {
                size: length,
                capacity: handle.size(),
            });
        }
        if handle.checksame(data)? {
            say(feedback, &format!("Checking old image {}... already updated", name));
            return Err(FirmwareError::SameImage);
        }
        say(feedback, &format!("Checking old image {}... needs update", name));

        say(feedback, &format!("Erasing '{}'...", name));
        handle.erase(length)?;
        say(feedback, &format!("Programming '{}'...", name));
        handle.program(data)?;
        handle.close();
        info!("Flashed {} bytes to {}", length, name);
        Ok(())
    }

    /// [`Orchestrator::flash_partition`] treating an identical partition as
    /// success; returns whether anything was written
    pub fn flash_partition_if_needed(
        &self,
        name: &str,
        data: &[u8],
        feedback: Option<&Arc<dyn Feedback>>,
    ) -> FirmwareResult<bool> {
        match self.flash_partition(name, data, feedback) {
            Ok(()) => Ok(true),
            Err(FirmwareError::SameImage) => {
                debug!("{} already up to date", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Make the backup image the one booted next
    ///
    /// The caller must hold the download slot.
    pub fn swap_images(&self) -> FirmwareResult<()> {
        let Some(backup) = &self.config.backup_partition else {
            return Err(FirmwareError::config("no backup partition configured"));
        };
        self.set_state(UpdateState::Swapping, None);
        self.tables
            .swap_active(&self.config.primary_partition, backup)
            .inspect_err(|_| self.set_state(UpdateState::SwapFailed, None))?;
        self.set_state(UpdateState::SwapDone, None);
        Ok(())
    }

    fn read_sideband(&self, name: &str) -> FirmwareResult<Option<SidebandRecord>> {
        let mut handle = FlashHandle::open(self.provider.as_ref(), name)?;
        let header = read_header_from_flash(&mut handle)?;
        let end = installed_length(&mut handle, &header)?;
        let offset = SidebandRecord::offset_for(&handle, end);
        SidebandRecord::read(&mut handle, offset)
    }

    /// Header and sideband details of the image installed in `name`
    pub fn image_status(&self, name: &str) -> FirmwareResult<ImageStatus> {
        let mut handle = FlashHandle::open(self.provider.as_ref(), name)?;
        let header = read_header_from_flash(&mut handle)?;
        let end = installed_length(&mut handle, &header)?;
        let offset = SidebandRecord::offset_for(&handle, end);
        let sideband = SidebandRecord::read(&mut handle, offset)?;
        let metadata = find_tlv_in_flash(&mut handle, &header, TlvType::Metadata)?
            .map(|data| trimmed_text(&data));
        handle.close();

        Ok(ImageStatus {
            partition: name.to_string(),
            active: self.active_partition() == name,
            machine: header.machine_name(),
            soc_name: header.soc_name(),
            soc_id: header.soc_id,
            image_len: header.image_len,
            signature_type: header.signature_type,
            filename: sideband.as_ref().and_then(SidebandRecord::filename),
            stage2_filename: sideband.as_ref().and_then(SidebandRecord::stage2_filename),
            metadata,
        })
    }

    fn persist_stage2(&self, dir: &Path, trailer: &[u8]) -> FirmwareResult<String> {
        std::fs::create_dir_all(dir)?;
        let digest = Sha256::digest(trailer);
        let name = format!("stage2-{}", hex::encode(digest.get(..8).unwrap_or_default()));

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(trailer)?;
        file.as_file().sync_all()?;
        file.persist(dir.join(&name)).map_err(|e| e.error)?;
        info!(
            "Wrote {} byte stage-2 trailer to {}",
            trailer.len(),
            name
        );
        Ok(name)
    }

    /// Delete persisted stage-2 files no installed image refers to
    ///
    /// Returns how many files were removed.
    pub fn cleanup_stage2(&self) -> FirmwareResult<usize> {
        let Some(dir) = &self.config.stage2_dir else {
            return Ok(0);
        };
        let keep: Vec<String> = self
            .image_partitions()
            .iter()
            .filter_map(|name| match self.read_sideband(name) {
                Ok(sideband) => sideband.and_then(|s| s.stage2_filename()),
                Err(e) => {
                    debug!("No stage-2 reference in {} ({})", name, e);
                    None
                }
            })
            .collect();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0usize;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                debug!("Keeping stage-2 file {}", name);
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed unreferenced stage-2 file {}", name);
                    removed = removed.saturating_add(1);
                }
                Err(e) => warn!("Failed to remove stage-2 file {}: {}", name, e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fis::FisDescriptor;
    use crate::flash::SimFlashBank;
    use crate::image::ImageBuilder;
    use crate::platform::LineBuffer;
    use switchfw_crypto::StaticKeyProvider;

    const SOC: u32 = 0x7468;

    fn setup(
        config: FirmwareConfig,
    ) -> Result<(SimFlashBank, Orchestrator), Box<dyn std::error::Error>> {
        let bank = SimFlashBank::new();
        bank.add_partition("FIS_directory", 4096, 4096);
        bank.add_partition("Redundant_FIS", 4096, 4096);
        bank.add_partition("linux", 16384, 1024);
        bank.add_partition("linux.bk", 16384, 1024);
        bank.add_partition("RedBoot", 4096, 1024);
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(bank.clone()),
            Arc::new(StaticKeyProvider::new()),
        )
        .with_active_image(Arc::new(FixedActiveImage::new("linux")));
        orchestrator.tables().format(&[
            FisDescriptor::new("RedBoot", 0, 0x4_0000),
            FisDescriptor::new("linux", 0x4_0000, 0x10_0000),
            FisDescriptor::new("linux.bk", 0x14_0000, 0x10_0000),
        ])?;
        Ok((bank, orchestrator))
    }

    fn config() -> FirmwareConfig {
        FirmwareConfig {
            system: crate::config::SystemIdentity {
                soc_family: SOC,
                machine: Some("demo".to_string()),
            },
            ..FirmwareConfig::default()
        }
    }

    fn staged(data: Vec<u8>, feedback: Option<Arc<dyn Feedback>>) -> StagedImage {
        StagedImage {
            data,
            filename: "new.mfi".to_string(),
            feedback,
        }
    }

    #[test]
    fn test_target_is_inactive_backup() -> Result<(), Box<dyn std::error::Error>> {
        let (_bank, orchestrator) = setup(config())?;
        assert_eq!(orchestrator.target_partition(), "linux.bk");
        let orchestrator =
            orchestrator.with_active_image(Arc::new(FixedActiveImage::new("linux.bk")));
        assert_eq!(orchestrator.target_partition(), "linux");
        Ok(())
    }

    #[test]
    fn test_update_writes_backup_and_swaps() -> Result<(), Box<dyn std::error::Error>> {
        let (bank, orchestrator) = setup(config())?;
        let image = ImageBuilder::new("demo", SOC).kernel(vec![0x11; 600]).build()?;
        let lines = Arc::new(LineBuffer::new());

        let report = orchestrator.update(&staged(image.clone(), Some(lines.clone())), None)?;
        assert_eq!(report.partition, "linux.bk");
        assert!(report.swapped);
        assert_eq!(report.bootloader, BootloaderAction::Absent);

        let contents = bank.contents("linux.bk").ok_or("missing partition")?;
        assert_eq!(contents.get(..image.len()), Some(image.as_slice()));
        assert!(lines.lines().iter().any(|l| l == "Programming flash..."));
        assert_eq!(orchestrator.status().state, Some(UpdateState::Done));
        assert_eq!(orchestrator.status().upload, UploadStatus::Success);

        let status = orchestrator.image_status("linux.bk")?;
        assert_eq!(status.filename.as_deref(), Some("new.mfi"));
        assert_eq!(status.machine, "demo");
        Ok(())
    }

    #[test]
    fn test_invalid_image_touches_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let (bank, orchestrator) = setup(config())?;
        let image = ImageBuilder::new("other-board", SOC).kernel(vec![1; 64]).build()?;
        bank.clear_logs();

        let result = orchestrator.update(&staged(image, None), None);
        assert!(matches!(
            result,
            Err(FirmwareError::Image(ImageError::IncompatibleTarget { .. }))
        ));
        assert!(bank.write_log("linux.bk").is_empty());
        assert_eq!(orchestrator.status().state, Some(UpdateState::InvalidImage));
        assert_eq!(
            orchestrator.status().upload,
            UploadStatus::IncompatibleTarget
        );
        Ok(())
    }

    #[test]
    fn test_flash_partition_if_needed_skips_identical() -> Result<(), Box<dyn std::error::Error>>
    {
        let (bank, orchestrator) = setup(config())?;
        assert!(orchestrator.flash_partition_if_needed("RedBoot", b"boot", None)?);
        bank.clear_logs();
        assert!(!orchestrator.flash_partition_if_needed("RedBoot", b"boot", None)?);
        assert!(bank.write_log("RedBoot").is_empty());
        assert!(matches!(
            orchestrator.flash_partition("RedBoot", &[0u8; 8192], None),
            Err(FirmwareError::ImageTooLarge { .. })
        ));
        Ok(())
    }
}
