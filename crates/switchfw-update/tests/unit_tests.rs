//! Unit tests for the firmware update engine

mod config_tests {
    use std::time::Duration;
    use switchfw_update::prelude::*;

    #[test]
    fn test_default_layout() {
        let config = FirmwareConfig::default();
        assert_eq!(config.primary_partition, "linux");
        assert_eq!(config.backup_partition.as_deref(), Some("linux.bk"));
        assert_eq!(config.primary_table, "FIS_directory");
        assert_eq!(config.redundant_table, "Redundant_FIS");
        assert_eq!(config.bootloader_partition, "RedBoot");
        assert!(!config.allow_unsigned);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(
            FirmwareConfig::builder()
                .max_download_size(0)
                .build()
                .is_err()
        );
        assert!(
            FirmwareConfig::builder()
                .session_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(
            FirmwareConfig::builder()
                .tables("FIS", "FIS")
                .build()
                .is_err()
        );
        assert!(
            FirmwareConfig::builder()
                .backup_partition(Some("linux".to_string()))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_json_config_fills_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config = FirmwareConfig::from_json_str(
            r#"{ "allow_unsigned": true, "session_timeout": 1500, "system": { "soc_family": 29800 } }"#,
        )?;
        assert!(config.allow_unsigned);
        assert_eq!(config.session_timeout, Duration::from_millis(1500));
        assert_eq!(config.system.soc_family, 29800);
        assert_eq!(config.primary_partition, "linux");
        Ok(())
    }

    #[test]
    fn test_json_config_is_validated() {
        let result = FirmwareConfig::from_json_str(r#"{ "primary_partition": "" }"#);
        assert!(matches!(result, Err(FirmwareError::Config(_))));
    }

    #[test]
    fn test_load_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("firmware.json");
        std::fs::write(&path, r#"{ "backup_partition": null }"#)?;
        let config = FirmwareConfig::load(&path)?;
        assert!(config.backup_partition.is_none());
        Ok(())
    }
}

mod error_tests {
    use switchfw_update::error::FlashError;
    use switchfw_update::prelude::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            FirmwareError::ChunkOutOfOrder { expected: 2, got: 4 }.to_string(),
            "Chunk 4 out of order, expected 2"
        );
        assert!(
            FirmwareError::Flash(FlashError::NotFound("linux".to_string()))
                .to_string()
                .contains("linux")
        );
    }

    #[test]
    fn test_protocol_errors_are_recoverable() {
        assert!(FirmwareError::Busy.is_recoverable());
        assert!(FirmwareError::IncompleteChunks { received: 1, total: 2 }.is_recoverable());
        assert!(!FirmwareError::SignatureMissing.is_recoverable());
        assert_eq!(FirmwareError::TableFull.kind(), ErrorKind::Configuration);
    }
}

mod state_tests {
    use switchfw_update::error::{FlashError, ImageError};
    use switchfw_update::prelude::*;

    #[test]
    fn test_messages_shown_to_requester() {
        assert_eq!(UpdateState::Erasing.message(), "Erasing flash...");
        assert_eq!(UpdateState::InvalidImage.message(), "Error: Invalid image");
        assert_eq!(UpdateState::Reboot.to_string(), "Restarting, please wait...");
        assert!(UpdateState::Done.message().starts_with("Firmware update completed"));
    }

    #[test]
    fn test_failure_states() {
        assert!(UpdateState::EraseFailed.is_failure());
        assert!(UpdateState::SwapFailed.is_failure());
        assert!(!UpdateState::SwapDone.is_failure());
        assert!(!UpdateState::Reboot.is_failure());
    }

    #[test]
    fn test_errors_map_to_states_and_codes() {
        let erase = FirmwareError::Flash(FlashError::EraseFailed {
            offset: 0,
            reason: "stuck".to_string(),
        });
        assert_eq!(UpdateState::for_error(&erase), UpdateState::EraseFailed);
        assert_eq!(UploadStatus::from_error(&erase), UploadStatus::EraseFlash);

        let board = FirmwareError::Image(ImageError::IncompatibleTarget {
            expected: "a".to_string(),
            actual: "b".to_string(),
        });
        assert_eq!(UpdateState::for_error(&board), UpdateState::InvalidImage);
        assert_eq!(UploadStatus::from_error(&board), UploadStatus::IncompatibleTarget);

        assert_eq!(
            UploadStatus::from_error(&FirmwareError::SameImage),
            UploadStatus::SameImage
        );
        assert_eq!(
            UploadStatus::from_result::<()>(&Ok(())),
            UploadStatus::Success
        );
    }

    #[test]
    fn test_upload_status_serializes_snake_case() -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&UploadStatus::ChunkOutOfOrder)?;
        assert_eq!(json, "\"chunk_out_of_order\"");
        assert_eq!(UploadStatus::default(), UploadStatus::None);
        Ok(())
    }
}

mod image_tests {
    use switchfw_update::error::ImageError;
    use switchfw_update::image::{IMAGE_HEADER_SIZE, check_header};
    use switchfw_update::prelude::*;

    #[test]
    fn test_header_roundtrip_fields() -> Result<(), Box<dyn std::error::Error>> {
        let image = ImageBuilder::new("board-a", 0x10)
            .soc_name("ocelot")
            .kernel(vec![0xAB; 40])
            .build()?;
        let header = ImageHeader::parse(&image)?;
        assert!(header.has_valid_magic());
        assert_eq!(header.machine_name(), "board-a");
        assert_eq!(header.soc_name(), "ocelot");
        assert_eq!(header.header_len(), IMAGE_HEADER_SIZE);
        assert_eq!(header.image_len(), image.len());
        Ok(())
    }

    #[test]
    fn test_long_names_are_truncated() {
        let header = ImageHeader::new(&"m".repeat(64), "soc", 1, 0);
        assert_eq!(header.machine_name().len(), 31);
    }

    #[test]
    fn test_wrong_chip_family() -> Result<(), Box<dyn std::error::Error>> {
        let image = ImageBuilder::new("demo", 0x10).kernel(vec![1; 8]).build()?;
        assert!(matches!(
            check_header(&image, 0x11),
            Err(ImageError::WrongChipFamily { .. })
        ));
        assert!(check_header(&image, 0x10).is_ok());
        Ok(())
    }

    #[test]
    fn test_truncated_image() -> Result<(), Box<dyn std::error::Error>> {
        let image = ImageBuilder::new("demo", 0x10).kernel(vec![1; 64]).build()?;
        let short = image.get(..image.len() - 4).ok_or("short image")?;
        assert!(matches!(
            check_header(short, 0x10),
            Err(ImageError::Truncated { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_tlv_types() {
        assert_eq!(TlvType::from_raw(1), Some(TlvType::Kernel));
        assert_eq!(TlvType::from_raw(5), Some(TlvType::Metadata));
        assert_eq!(TlvType::from_raw(0), None);
        assert_eq!(TlvType::Signature.as_raw(), 2);
    }

    #[test]
    fn test_sha_signature_needs_key() {
        let result = ImageBuilder::new("demo", 1)
            .kernel(vec![1; 8])
            .signature(SignatureType::Sha256)
            .build();
        assert!(matches!(result, Err(FirmwareError::Config(_))));
    }
}

mod sideband_tests {
    use switchfw_update::sideband::{SIDEBAND_HEADER_SIZE, SidebandType};
    use switchfw_update::prelude::*;

    #[test]
    fn test_names_survive_encoding() {
        let mut record = SidebandRecord::new();
        record.set_filename("fw.mfi");
        record.set_stage2_filename("stage2-0011223344556677");
        let decoded = SidebandRecord::decode(&record.encode());
        assert_eq!(decoded.as_ref().and_then(SidebandRecord::filename).as_deref(), Some("fw.mfi"));
        assert_eq!(
            decoded
                .as_ref()
                .and_then(SidebandRecord::stage2_filename)
                .as_deref(),
            Some("stage2-0011223344556677")
        );
    }

    #[test]
    fn test_set_replaces_previous_value() {
        let mut record = SidebandRecord::new();
        record.add_tlv(SidebandType::Filename, b"a\0");
        record.add_tlv(SidebandType::Filename, b"b\0");
        record.set_filename("c");
        assert_eq!(record.filename().as_deref(), Some("c"));
        record.delete_tlv(SidebandType::Filename);
        assert!(record.filename().is_none());
        assert_eq!(record.length(), SIDEBAND_HEADER_SIZE);
    }

    #[test]
    fn test_corrupt_checksum_is_rejected() {
        let mut record = SidebandRecord::new();
        record.set_filename("fw.mfi");
        let mut encoded = record.encode();
        if let Some(last) = encoded.last_mut() {
            *last ^= 0xFF;
        }
        assert!(SidebandRecord::decode(&encoded).is_none());
        assert!(SidebandRecord::decode(&[0xFF; 64]).is_none());
    }
}

mod fis_tests {
    use std::sync::Arc;
    use switchfw_update::fis::{FIS_ENTRY_SIZE, FisTable};
    use switchfw_update::prelude::*;

    fn manager() -> Result<(SimFlashBank, FisManager), Box<dyn std::error::Error>> {
        let bank = SimFlashBank::new();
        bank.add_partition("FIS_directory", 4096, 4096);
        bank.add_partition("Redundant_FIS", 4096, 4096);
        let manager = FisManager::new(Arc::new(bank.clone()), "FIS_directory", "Redundant_FIS");
        manager.format(&[
            FisDescriptor::new("RedBoot", 0, 0x4_0000),
            FisDescriptor::new("linux", 0x4_0000, 0x20_0000),
        ])?;
        Ok((bank, manager))
    }

    #[test]
    fn test_descriptor_encoding() {
        let desc = FisDescriptor::new("linux", 0x4_0000, 0x10_0000);
        let encoded = desc.encode();
        assert_eq!(encoded.len(), FIS_ENTRY_SIZE);
        assert_eq!(FisDescriptor::parse(&encoded), Some(desc));
        assert!(!FisDescriptor::erased().is_valid_entry());
    }

    #[test]
    fn test_table_needs_free_slot() {
        let entries = vec![FisDescriptor::new("a", 0, 1), FisDescriptor::new("b", 1, 1)];
        assert!(matches!(
            FisTable::with_entries(2, &entries),
            Err(FirmwareError::TableFull)
        ));
    }

    #[test]
    fn test_unformatted_flash_has_no_table() {
        let bank = SimFlashBank::new();
        bank.add_partition("FIS_directory", 4096, 4096);
        bank.add_partition("Redundant_FIS", 4096, 4096);
        let manager = FisManager::new(Arc::new(bank), "FIS_directory", "Redundant_FIS");
        assert!(matches!(manager.read(), Err(FirmwareError::NoValidTable)));
    }

    #[test]
    fn test_split_carves_backup() -> Result<(), Box<dyn std::error::Error>> {
        let (_bank, manager) = manager()?;
        manager.split("linux", 0x10_0000, "linux.bk", 0x10_0000)?;

        let linux = manager.find("linux")?.ok_or("linux missing")?;
        let backup = manager.find("linux.bk")?.ok_or("backup missing")?;
        assert_eq!(linux.size, 0x10_0000);
        assert_eq!(backup.flash_base, 0x14_0000);
        assert_eq!(backup.size, 0x10_0000);
        assert_eq!(manager.list()?.len(), 3);

        assert!(matches!(
            manager.split("linux", 1, "linux.bk", 1),
            Err(FirmwareError::PartitionExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_split_rejects_oversize() -> Result<(), Box<dyn std::error::Error>> {
        let (_bank, manager) = manager()?;
        assert!(matches!(
            manager.split("linux", 0x20_0000, "linux.bk", 1),
            Err(FirmwareError::Config(_))
        ));
        assert!(matches!(
            manager.split("missing", 1, "x", 1),
            Err(FirmwareError::PartitionNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_resize_and_swap_unknown() -> Result<(), Box<dyn std::error::Error>> {
        let (_bank, manager) = manager()?;
        manager.resize("linux", 0x18_0000)?;
        assert_eq!(manager.find("linux")?.map(|d| d.size), Some(0x18_0000));
        assert!(matches!(
            manager.swap_active("linux", "linux.bk"),
            Err(FirmwareError::PartitionNotFound(name)) if name == "linux.bk"
        ));
        Ok(())
    }
}

mod flash_tests {
    use switchfw_update::prelude::*;

    #[test]
    fn test_file_bank_persists_writes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let bank = FileFlashBank::new(dir.path(), 1024);
        bank.create_partition("linux", 4096)?;
        assert!(bank.exists("linux"));
        assert!(!bank.exists("../linux"));

        let mut handle = FlashHandle::open(&bank, "linux")?;
        handle.erase(2000)?;
        handle.program(&[0x12; 2000])?;
        handle.close();

        let mut reopened = FlashHandle::open(&FileFlashBank::new(dir.path(), 1024), "linux")?;
        assert!(reopened.checksame(&[0x12; 2000])?);
        assert_eq!(reopened.read_vec(2000, 4)?, vec![0xFF; 4]);
        Ok(())
    }

    #[test]
    fn test_out_of_bounds_program() -> Result<(), Box<dyn std::error::Error>> {
        let bank = SimFlashBank::new();
        bank.add_partition("small", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "small")?;
        assert!(handle.program(&[0u8; 2048]).is_err());
        assert!(FlashHandle::open(&bank, "missing").is_err());
        Ok(())
    }

    #[test]
    fn test_truncated_write_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let bank = SimFlashBank::new();
        bank.add_partition("p", 1024, 256);
        let mut handle = FlashHandle::open(&bank, "p")?;
        bank.truncate_nth_write(1);
        assert!(handle.program_at(&[0u8; 64], 0).is_err());
        assert_eq!(bank.write_log("p"), vec![(0, 32)]);
        Ok(())
    }
}

mod download_tests {
    use switchfw_update::prelude::*;
    use switchfw_update::{FirmwareDownload, download::UNKNOWN_FILENAME};

    #[test]
    fn test_size_limit() {
        let mut download = FirmwareDownload::new(16);
        assert!(download.write(&[0; 10]).is_ok());
        assert!(matches!(
            download.write(&[0; 10]),
            Err(FirmwareError::SizeExceeded { max: 16, .. })
        ));
    }

    #[test]
    fn test_filename_is_basename() {
        let mut download = FirmwareDownload::new(16);
        download.set_filename("tftp://10.0.0.1/images/new.mfi");
        assert_eq!(download.filename(), "new.mfi");
        download.set_filename("http://host/");
        assert_eq!(download.filename(), UNKNOWN_FILENAME);
    }

    #[test]
    fn test_staged_download_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut download = FirmwareDownload::in_dir(dir.path(), 1024)?;
        download.write(b"hello ")?;
        download.write(b"flash")?;
        download.set_filename("a.bin");
        let image = download.finish()?;
        assert_eq!(image.data, b"hello flash");
        assert_eq!(image.filename, "a.bin");
        Ok(())
    }

    #[test]
    fn test_chunk_bookkeeping() -> Result<(), Box<dyn std::error::Error>> {
        let mut download = FirmwareDownload::new(64);
        download.set_total_chunks(2)?;
        assert_eq!(download.next_expected_chunk(), 1);
        assert!(download.accept_chunk(0, b"x").is_err());
        assert!(download.accept_chunk(3, b"x").is_err());
        assert_eq!(download.accept_chunk(1, b"ab")?, ChunkOutcome::Accepted);
        assert!(download.has_chunk(1));
        assert!(!download.is_complete());
        assert_eq!(download.accept_chunk(2, b"cd")?, ChunkOutcome::Accepted);
        assert!(download.is_complete());
        assert_eq!(download.len(), 4);
        Ok(())
    }
}
