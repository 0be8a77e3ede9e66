//! Flash bank and partition table commands

use std::sync::Arc;

use anyhow::Result;
use switchfw_update::flash::align_up;
use switchfw_update::{FisDescriptor, FisManager, FlashProvider};
use tracing::info;

use crate::commands::FlashCommands;
use crate::engine::{Engine, EngineArgs};
use crate::error::CliError;
use crate::output::{self, PartitionReport, StatusReport, TableEntry};

/// Smallest partition table region
const MIN_TABLE_SIZE: u64 = 4096;

/// Execute flash command
pub fn execute(cmd: &FlashCommands, args: &EngineArgs, json: bool) -> Result<()> {
    match cmd {
        FlashCommands::Init {
            image_size,
            bootloader_size,
            no_backup,
            force,
        } => init(args, *image_size, *bootloader_size, *no_backup, *force, json),
        FlashCommands::List => list(args, json),
    }
}

fn init(
    args: &EngineArgs,
    image_size: u32,
    bootloader_size: u32,
    no_backup: bool,
    force: bool,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(args)?;
    let config = &engine.config;
    let erase_size = args.erase_size.max(1);
    for (what, size) in [("image", image_size), ("bootloader", bootloader_size)] {
        if size == 0 || size % erase_size != 0 {
            return Err(CliError::InvalidArgument(format!(
                "{} size {} is not a multiple of the {} byte erase size",
                what, size, erase_size
            ))
            .into());
        }
    }
    let table_size = u32::try_from(align_up(MIN_TABLE_SIZE, u64::from(erase_size)))
        .map_err(|e| CliError::InvalidArgument(format!("erase size too large: {}", e)))?;

    let mut layout = vec![
        (config.primary_table.clone(), table_size),
        (config.redundant_table.clone(), table_size),
        (config.bootloader_partition.clone(), bootloader_size),
        (config.primary_partition.clone(), image_size),
    ];
    if let Some(backup) = config.backup_partition.as_ref().filter(|_| !no_backup) {
        layout.push((backup.clone(), image_size));
    }

    if !force
        && let Some((name, _)) = layout.iter().find(|(name, _)| engine.bank.exists(name))
    {
        return Err(CliError::InvalidArgument(format!(
            "{} already holds {}, pass --force to recreate it",
            engine.flash_dir().display(),
            name
        ))
        .into());
    }

    let mut entries = Vec::with_capacity(layout.len());
    let mut flash_base = 0u32;
    for (name, size) in &layout {
        engine
            .bank
            .create_partition(name, u64::from(*size))
            .map_err(switchfw_update::FirmwareError::from)
            .map_err(CliError::from)?;
        entries.push(FisDescriptor::new(name, flash_base, *size));
        flash_base = flash_base.checked_add(*size).ok_or_else(|| {
            CliError::InvalidArgument("layout exceeds the 32-bit flash address space".to_string())
        })?;
    }

    let tables = FisManager::new(
        Arc::new(engine.bank.clone()),
        config.primary_table.clone(),
        config.redundant_table.clone(),
    );
    tables.format(&entries).map_err(CliError::from)?;
    info!(
        "Initialized {} flash regions in {}",
        layout.len(),
        engine.flash_dir().display()
    );

    let table: Vec<TableEntry> = entries.iter().map(TableEntry::from).collect();
    output::print_table(&engine.flash_dir().display().to_string(), &table, json);
    Ok(())
}

fn list(args: &EngineArgs, json: bool) -> Result<()> {
    let engine = Engine::open(args)?;
    engine.require_initialized()?;
    let current = engine
        .orchestrator()
        .tables()
        .read()
        .map_err(CliError::from)?;
    let table: Vec<TableEntry> = current.table.entries().map(TableEntry::from).collect();
    output::print_table(&current.active, &table, json);
    Ok(())
}

/// Installed images and the authoritative partition table
pub fn status(args: &EngineArgs, json: bool) -> Result<()> {
    let engine = Engine::open(args)?;
    engine.require_initialized()?;
    let orchestrator = engine.orchestrator();
    let current = orchestrator.tables().read().map_err(CliError::from)?;

    let partitions = orchestrator
        .image_partitions()
        .into_iter()
        .map(|name| match orchestrator.image_status(&name) {
            Ok(image) => PartitionReport {
                partition: name,
                image: Some(image),
                problem: None,
            },
            Err(e) => PartitionReport {
                partition: name,
                image: None,
                problem: Some(e.to_string()),
            },
        })
        .collect();

    output::print_status(
        &StatusReport {
            flash_dir: engine.flash_dir().to_path_buf(),
            table_region: current.active.clone(),
            table_version: current.table.version(),
            active_partition: orchestrator.active_partition(),
            target_partition: orchestrator.target_partition(),
            partitions,
            table: current.table.entries().map(TableEntry::from).collect(),
        },
        json,
    );
    Ok(())
}
