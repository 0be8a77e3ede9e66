//! End-to-end update flows against simulated flash

use std::sync::Arc;
use std::time::Duration;

use switchfw_crypto::SignatureType;
use switchfw_update::fis::{FIS_FLAG_IN_PROGRESS, FIS_FLAGS_OFFSET};
use switchfw_update::image::{STAGE2_MAGIC, check_header};
use switchfw_update::prelude::*;
use switchfw_update::{FirmwareError, FisDescriptor};
use tracing_test::traced_test;

const SOC: u32 = 0x7468;
const LINUX_BASE: u32 = 0x4_0000;
const BACKUP_BASE: u32 = 0x14_0000;

struct Rig {
    bank: SimFlashBank,
    restarts: Arc<RestartLog>,
}

impl Rig {
    fn new() -> Self {
        let bank = SimFlashBank::new();
        bank.add_partition("FIS_directory", 4096, 4096);
        bank.add_partition("Redundant_FIS", 4096, 4096);
        bank.add_partition("linux", 16384, 1024);
        bank.add_partition("linux.bk", 16384, 1024);
        bank.add_partition("RedBoot", 4096, 1024);
        Self {
            bank,
            restarts: Arc::new(RestartLog::new()),
        }
    }

    fn orchestrator(
        &self,
        config: FirmwareConfig,
        keys: StaticKeyProvider,
    ) -> Result<Orchestrator, Box<dyn std::error::Error>> {
        let orchestrator = Orchestrator::new(config, Arc::new(self.bank.clone()), Arc::new(keys))
            .with_active_image(Arc::new(FixedActiveImage::new("linux")))
            .with_restart(self.restarts.clone());
        orchestrator.tables().format(&[
            FisDescriptor::new("RedBoot", 0, LINUX_BASE),
            FisDescriptor::new("linux", LINUX_BASE, 0x10_0000),
            FisDescriptor::new("linux.bk", BACKUP_BASE, 0x10_0000),
        ])?;
        self.bank.clear_logs();
        Ok(orchestrator)
    }
}

fn base_config() -> FirmwareConfig {
    FirmwareConfig {
        system: SystemIdentity {
            soc_family: SOC,
            machine: None,
        },
        ..FirmwareConfig::default()
    }
}

fn staged(data: Vec<u8>, filename: &str) -> switchfw_update::StagedImage {
    switchfw_update::StagedImage {
        data,
        filename: filename.to_string(),
        feedback: None,
    }
}

fn base_of(orchestrator: &Orchestrator, name: &str) -> Result<u32, Box<dyn std::error::Error>> {
    let desc = orchestrator
        .tables()
        .find(name)?
        .ok_or_else(|| format!("{} missing from table", name))?;
    Ok(desc.flash_base)
}

#[test]
#[traced_test]
fn test_signed_demo_image_installs_and_restarts() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let keypair = KeyPair::generate()?;
    let keys = StaticKeyProvider::with_firmware_key(keypair.public_key.clone());

    // Board identity comes from the image already running.
    let running = ImageBuilder::new("demo", SOC).kernel(vec![0x22; 256]).build()?;
    rig.bank.load("linux", 0, &running)?;
    let orchestrator = rig.orchestrator(base_config(), keys)?;

    let image = ImageBuilder::new("demo", SOC)
        .kernel(vec![0x5A; 1320])
        .signature(SignatureType::Sha256)
        .signing_key(keypair)
        .build()?;
    assert_eq!(image.len(), 1500);

    let header = check_header(&image, SOC)?;
    assert_eq!(header.image_len, 1500);
    orchestrator.validator().verify_signature(&image, &header)?;

    let report = orchestrator.update(&staged(image.clone(), "demo.mfi"), Some(RestartMode::Cold))?;
    assert_eq!(report.partition, "linux.bk");
    assert_eq!(report.bytes_written, 1500);
    assert_eq!(report.bootloader, BootloaderAction::Absent);
    assert!(report.swapped);
    assert_eq!(report.restart, Some(RestartMode::Cold));
    assert_eq!(rig.restarts.requests(), vec![RestartMode::Cold]);

    let status = orchestrator.status();
    assert_eq!(status.state, Some(UpdateState::Reboot));
    assert_eq!(status.upload, UploadStatus::Success);

    let contents = rig.bank.contents("linux.bk").ok_or("missing partition")?;
    assert_eq!(contents.get(..1500), Some(image.as_slice()));
    assert_eq!(base_of(&orchestrator, "linux")?, BACKUP_BASE);
    assert_eq!(base_of(&orchestrator, "linux.bk")?, LINUX_BASE);
    assert!(logs_contain("Installed demo.mfi in linux.bk"));
    Ok(())
}

#[test]
fn test_payload_is_written_before_header_block() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let orchestrator = rig.orchestrator(base_config(), StaticKeyProvider::new())?;
    let image = ImageBuilder::new("demo", SOC).kernel(vec![0x77; 1320]).build()?;
    let len = image.len();

    orchestrator.update(&staged(image, "order.mfi"), None)?;

    let log = rig.bank.write_log("linux.bk");
    assert_eq!(log.first(), Some(&(1024, len - 1024)));
    assert_eq!(log.get(1), Some(&(0, 1024)));
    // Sideband follows in the next erase block.
    assert!(log.iter().skip(2).all(|(offset, _)| *offset >= 2048));
    assert_eq!(orchestrator.status().state, Some(UpdateState::Done));
    Ok(())
}

#[test]
fn test_interrupted_table_write_keeps_previous_table() -> Result<(), Box<dyn std::error::Error>> {
    for fault in [1usize, 2] {
        let rig = Rig::new();
        let orchestrator = rig.orchestrator(base_config(), StaticKeyProvider::new())?;
        let before = orchestrator.tables().read()?;

        rig.bank.fail_nth_write(fault);
        let result = orchestrator.tables().swap_active("linux", "linux.bk");
        assert!(result.is_err(), "write {} should have failed", fault);
        rig.bank.clear_faults();

        let after = orchestrator.tables().read()?;
        assert_eq!(after.active, "FIS_directory");
        assert_eq!(after.table.version(), before.table.version());
        assert_eq!(base_of(&orchestrator, "linux")?, LINUX_BASE);
        assert_eq!(base_of(&orchestrator, "linux.bk")?, BACKUP_BASE);

        if fault == 2 {
            let redundant = rig.bank.contents("Redundant_FIS").ok_or("missing table")?;
            assert_eq!(redundant.get(FIS_FLAGS_OFFSET), Some(&FIS_FLAG_IN_PROGRESS));
        }
    }
    Ok(())
}

#[test]
fn test_committed_table_alternates_regions() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let orchestrator = rig.orchestrator(base_config(), StaticKeyProvider::new())?;

    orchestrator.swap_images()?;
    let first = orchestrator.tables().read()?;
    assert_eq!(first.active, "Redundant_FIS");
    assert_eq!(first.table.version(), 2);

    orchestrator.swap_images()?;
    let second = orchestrator.tables().read()?;
    assert_eq!(second.active, "FIS_directory");
    assert_eq!(second.table.version(), 3);
    assert_eq!(base_of(&orchestrator, "linux")?, LINUX_BASE);
    Ok(())
}

#[test]
fn test_erase_failure_leaves_table_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let orchestrator = rig.orchestrator(base_config(), StaticKeyProvider::new())?;
    let image = ImageBuilder::new("demo", SOC).kernel(vec![1; 512]).build()?;

    rig.bank.fail_nth_erase(1);
    let result = orchestrator.update(&staged(image, "broken.mfi"), Some(RestartMode::Cold));
    assert!(matches!(result, Err(FirmwareError::Flash(_))));

    let status = orchestrator.status();
    assert_eq!(status.state, Some(UpdateState::EraseFailed));
    assert_eq!(status.upload, UploadStatus::EraseFlash);
    assert!(rig.restarts.requests().is_empty());
    assert_eq!(base_of(&orchestrator, "linux")?, LINUX_BASE);
    Ok(())
}

#[test]
fn test_tampered_image_is_rejected_before_erase() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let keypair = KeyPair::generate()?;
    let keys = StaticKeyProvider::with_firmware_key(keypair.public_key.clone());
    let orchestrator = rig.orchestrator(base_config(), keys)?;

    let mut image = ImageBuilder::new("demo", SOC)
        .kernel(vec![9; 400])
        .signature(SignatureType::Sha512)
        .signing_key(keypair)
        .build()?;
    if let Some(byte) = image.get_mut(200) {
        *byte ^= 0x01;
    }

    let result = orchestrator.update(&staged(image, "tampered.mfi"), None);
    assert!(result.is_err());
    assert_eq!(rig.bank.erase_count("linux.bk"), 0);
    assert_eq!(orchestrator.status().state, Some(UpdateState::InvalidImage));
    assert_eq!(orchestrator.status().upload, UploadStatus::InvalidImage);
    Ok(())
}

#[test]
fn test_stage2_trailer_is_persisted_and_bootloader_flashed() -> Result<(), Box<dyn std::error::Error>>
{
    let dir = tempfile::tempdir()?;
    let rig = Rig::new();
    let config = FirmwareConfig {
        stage2_dir: Some(dir.path().to_path_buf()),
        ..base_config()
    };
    let orchestrator = rig.orchestrator(config, StaticKeyProvider::new())?;
    std::fs::write(dir.path().join("stage2-0000000000000000"), b"stale")?;

    let bootloader = vec![0xB0u8; 300];
    let image = ImageBuilder::new("demo", SOC)
        .kernel(vec![3; 700])
        .stage2(Stage2Record::bootloader(bootloader.clone()))
        .stage2(Stage2Record::rootfs(vec![0x0F; 128]))
        .build()?;
    let info = orchestrator.check_image(&image)?;
    assert_eq!(info.stage2.len(), 2);

    let report = orchestrator.update(&staged(image.clone(), "full.mfi"), None)?;
    assert_eq!(report.bootloader, BootloaderAction::Flashed);
    assert_eq!(report.bytes_written, info.stage1_len as u64);
    let stage2_file = report.stage2_file.ok_or("no stage-2 file")?;
    assert!(stage2_file.starts_with("stage2-"));

    let persisted = std::fs::read(dir.path().join(&stage2_file))?;
    assert_eq!(Some(persisted.as_slice()), image.get(info.stage1_len..));
    assert!(!dir.path().join("stage2-0000000000000000").exists());

    let redboot = rig.bank.contents("RedBoot").ok_or("missing bootloader partition")?;
    assert_eq!(redboot.get(..300), Some(bootloader.as_slice()));

    let status = orchestrator.image_status("linux.bk")?;
    assert_eq!(status.filename.as_deref(), Some("full.mfi"));
    assert_eq!(status.stage2_filename.as_deref(), Some(stage2_file.as_str()));

    // The same bootloader again leaves the partition alone.
    rig.bank.clear_logs();
    let report = orchestrator.update(&staged(image, "full.mfi"), None)?;
    assert_eq!(report.bootloader, BootloaderAction::Unchanged);
    assert!(rig.bank.write_log("RedBoot").is_empty());
    Ok(())
}

#[test]
fn test_metadata_is_reported_by_image_status() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let orchestrator = rig.orchestrator(base_config(), StaticKeyProvider::new())?;
    let image = ImageBuilder::new("demo", SOC)
        .soc_name("luton26")
        .kernel(vec![4; 128])
        .tlv(TlvType::Metadata, b"version=2.1\0".to_vec())
        .build()?;

    orchestrator.update(&staged(image, "meta.mfi"), None)?;
    let status = orchestrator.image_status("linux.bk")?;
    assert_eq!(status.metadata.as_deref(), Some("version=2.1"));
    assert_eq!(status.soc_name, "luton26");
    assert_eq!(status.soc_id, SOC);
    assert!(!status.active);
    Ok(())
}

#[test]
fn test_primary_only_layout_writes_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let rig = Rig::new();
    let config = FirmwareConfig {
        backup_partition: None,
        ..base_config()
    };
    let orchestrator = rig.orchestrator(config, StaticKeyProvider::new())?;
    let image = ImageBuilder::new("demo", SOC).kernel(vec![6; 300]).build()?;

    let report = orchestrator.update(&staged(image, "single.mfi"), None)?;
    assert_eq!(report.partition, "linux");
    assert!(!report.swapped);
    assert!(rig.bank.write_log("Redundant_FIS").is_empty());
    assert!(matches!(
        orchestrator.swap_images(),
        Err(FirmwareError::Config(_))
    ));
    Ok(())
}

mod service_flows {
    use super::*;

    fn service(rig: &Rig) -> Result<FirmwareService, Box<dyn std::error::Error>> {
        Ok(FirmwareService::new(
            rig.orchestrator(base_config(), StaticKeyProvider::new())?,
        )?)
    }

    #[test]
    fn test_chunked_upload_installs_in_background() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let service = service(&rig)?;
        let image = ImageBuilder::new("demo", SOC).kernel(vec![0x42; 900]).build()?;
        let id = SessionId(7);

        let chunks: Vec<&[u8]> = image.chunks(400).collect();
        let total = u32::try_from(chunks.len())?;
        service.start(id, total, "uploads/fw.mfi", None)?;
        for (n, chunk) in (1u32..).zip(&chunks) {
            assert_eq!(service.write(id, n, chunk, None)?, ChunkOutcome::Accepted);
        }
        assert_eq!(service.get_last_chunk(id)?, total);

        assert_eq!(service.commit(id, None)?, UploadStatus::InProgress);
        assert!(service.wait_idle(Duration::from_secs(10)));
        assert_eq!(service.slot_status(), SlotStatus::Free);

        let status = service.status();
        assert_eq!(status.upload, UploadStatus::Success);
        assert_eq!(status.state, Some(UpdateState::Done));
        assert_eq!(status.filename.as_deref(), Some("fw.mfi"));

        // Without a stage-2 directory the name travels behind the image.
        let contents = rig.bank.contents("linux.bk").ok_or("missing partition")?;
        assert_eq!(contents.get(..image.len()), Some(image.as_slice()));
        let magic = contents
            .get(image.len()..image.len() + 4)
            .ok_or("short partition")?;
        assert_eq!(magic, STAGE2_MAGIC.to_le_bytes());
        assert_eq!(
            service.image_status("linux.bk")?.filename.as_deref(),
            Some("fw.mfi")
        );
        service.shutdown();
        Ok(())
    }

    #[test]
    fn test_invalid_commit_frees_slot() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let service = service(&rig)?;
        let id = SessionId(3);

        service.start(id, 1, "junk.bin", None)?;
        service.write(id, 1, &[0u8; 256], None)?;
        let result = service.commit(id, None);
        assert!(matches!(result, Err(FirmwareError::Image(_))));
        assert_eq!(service.slot_status(), SlotStatus::Free);
        assert_eq!(service.status().upload, UploadStatus::InvalidImage);
        assert_eq!(rig.bank.erase_count("linux.bk"), 0);
        Ok(())
    }

    #[test]
    fn test_incomplete_commit_keeps_session_open() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let service = service(&rig)?;
        let id = SessionId(4);

        service.start(id, 2, "half.mfi", None)?;
        service.write(id, 1, b"first", None)?;
        assert!(matches!(
            service.commit(id, None),
            Err(FirmwareError::IncompleteChunks { received: 1, total: 2 })
        ));
        assert_eq!(service.slot_status(), SlotStatus::InUseAsync);
        assert_eq!(service.get_last_chunk(id)?, 1);
        service.abort(id)?;
        assert_eq!(service.slot_status(), SlotStatus::Free);
        Ok(())
    }

    #[test]
    fn test_session_blocks_other_uploads() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let service = service(&rig)?;
        let image = ImageBuilder::new("demo", SOC).kernel(vec![1; 64]).build()?;

        service.start(SessionId(1), 1, "a.mfi", None)?;
        assert!(matches!(
            service.update_async(&image, "b.mfi", None, None),
            Err(FirmwareError::Busy)
        ));
        assert!(matches!(
            service.write(SessionId(2), 1, b"x", None),
            Err(FirmwareError::Busy)
        ));
        assert!(matches!(service.swap_images(), Err(FirmwareError::Busy)));
        service.abort(SessionId(1))?;
        Ok(())
    }

    #[test]
    fn test_sync_update_reports_feedback() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let service = service(&rig)?;
        let image = ImageBuilder::new("demo", SOC).kernel(vec![8; 256]).build()?;
        let lines = Arc::new(LineBuffer::new());

        let report = service.update_sync(
            &image,
            "http://host/sync.mfi",
            Some(RestartMode::Warm),
            Some(lines.clone()),
        )?;
        assert_eq!(report.restart, Some(RestartMode::Warm));
        assert_eq!(rig.restarts.requests(), vec![RestartMode::Warm]);
        assert_eq!(service.slot_status(), SlotStatus::Free);

        let lines = lines.lines();
        assert_eq!(
            lines.first().map(String::as_str),
            Some("Starting flash update - do not power off device!")
        );
        assert!(lines.iter().any(|l| l == "Erasing flash..."));
        assert!(lines.iter().any(|l| l == "Restarting, please wait..."));
        Ok(())
    }

    #[test]
    fn test_async_update_rejects_other_board() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::new();
        let config = FirmwareConfig {
            system: SystemIdentity {
                soc_family: SOC,
                machine: Some("demo".to_string()),
            },
            ..FirmwareConfig::default()
        };
        let service =
            FirmwareService::new(rig.orchestrator(config, StaticKeyProvider::new())?)?;
        let image = ImageBuilder::new("other", SOC).kernel(vec![1; 64]).build()?;
        let lines = Arc::new(LineBuffer::new());

        let result = service.update_async(&image, "other.mfi", None, Some(lines.clone()));
        assert!(result.is_err());
        assert_eq!(service.status().upload, UploadStatus::IncompatibleTarget);
        assert!(lines.lines().iter().any(|l| l.starts_with("Error: Invalid image")));
        assert_eq!(service.slot_status(), SlotStatus::Free);
        Ok(())
    }
}
