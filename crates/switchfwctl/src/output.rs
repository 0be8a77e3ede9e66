//! Text and JSON rendering of command results

use std::path::PathBuf;

use anyhow::Error;
use colored::*;
use serde::Serialize;
use serde_json::json;
use switchfw_update::{
    BootloaderAction, Feedback, FisDescriptor, ImageStatus, UpdateReport, UpdateStatus,
};

use crate::error::CliError;

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format output as JSON: {}", e),
    }
}

fn error_type_name(error: &Error) -> &'static str {
    match error.downcast_ref::<CliError>() {
        Some(CliError::NotInitialized(_)) => "not_initialized",
        Some(CliError::InvalidArgument(_)) => "invalid_argument",
        Some(CliError::InvalidConfiguration(_)) => "invalid_configuration",
        Some(CliError::Firmware(_)) => "firmware",
        Some(CliError::UpdateFailed { .. }) => "update_failed",
        Some(CliError::Key(_)) => "key",
        Some(CliError::IoError(_)) => "io",
        None => "error",
    }
}

/// Error envelope on stdout for `--json` callers
pub fn print_error_json(error: &Error) {
    print_json(&json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "type": error_type_name(error)
        }
    }));
}

/// Error with its cause chain on stderr
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Progress lines printed as they arrive
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleFeedback;

impl Feedback for ConsoleFeedback {
    fn line(&self, text: &str) {
        if text.starts_with("Error") {
            println!("  {} {}", "›".red(), text);
        } else {
            println!("  {} {}", "›".dimmed(), text);
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KeyReport {
    pub key_file: PathBuf,
    pub identifier: String,
    pub fingerprint: String,
    pub installed: Option<PathBuf>,
}

pub fn print_key(report: &KeyReport, json: bool) {
    if json {
        print_json(&json!({ "success": true, "key": report }));
        return;
    }
    println!(
        "{} Generated key {} ({})",
        "✓".green(),
        report.identifier.bold(),
        report.key_file.display()
    );
    println!("  Fingerprint: {}", report.fingerprint.dimmed());
    if let Some(path) = &report.installed {
        println!("  Installed:   {}", path.display());
    }
}

#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub output: PathBuf,
    pub size: usize,
    pub md5: String,
    pub signature: String,
}

pub fn print_build(report: &BuildReport, json: bool) {
    if json {
        print_json(&json!({ "success": true, "image": report }));
        return;
    }
    println!(
        "{} Built {} ({} bytes, {})",
        "✓".green(),
        report.output.display().to_string().bold(),
        report.size,
        report.signature
    );
    println!("  MD5: {}", report.md5.dimmed());
}

#[derive(Debug, Serialize)]
pub struct RecordInfo {
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Inspection {
    pub file: PathBuf,
    pub size: usize,
    pub md5: String,
    pub version: u32,
    pub machine: String,
    pub soc_name: String,
    pub soc_id: u32,
    pub image_len: u32,
    pub signature: String,
    pub records: Vec<RecordInfo>,
    pub stage2: Vec<RecordInfo>,
    pub problems: Vec<String>,
    pub verified: Option<bool>,
}

fn print_records(title: &str, records: &[RecordInfo]) {
    if records.is_empty() {
        return;
    }
    println!("{}", title.bold());
    for record in records {
        let mut line = format!(
            "  {:<10} @ {:#08x}  {} bytes",
            record.kind, record.offset, record.length
        );
        if let Some(signature) = &record.signature {
            line.push_str(&format!("  [{}]", signature));
        }
        if let Some(name) = &record.name {
            line.push_str(&format!("  \"{}\"", name));
        }
        println!("{}", line);
    }
}

pub fn print_inspection(inspection: &Inspection, json: bool) {
    if json {
        print_json(&json!({ "success": true, "inspection": inspection }));
        return;
    }
    println!("{}", inspection.file.display().to_string().bold());
    println!("  Size:      {} bytes", inspection.size);
    println!("  MD5:       {}", inspection.md5.dimmed());
    println!("  Machine:   {}", inspection.machine);
    println!(
        "  SoC:       {} ({:#x})",
        inspection.soc_name, inspection.soc_id
    );
    println!("  Version:   {}", inspection.version);
    println!("  Stage 1:   {} bytes", inspection.image_len);
    println!("  Signature: {}", inspection.signature);
    print_records("Records:", &inspection.records);
    print_records("Stage 2:", &inspection.stage2);
    for problem in &inspection.problems {
        println!("{} {}", "⚠".yellow(), problem);
    }
    if inspection.verified == Some(true) {
        println!("{} Image verified", "✓".green());
    }
}

#[derive(Debug, Serialize)]
pub struct TableEntry {
    pub name: String,
    pub flash_base: u32,
    pub size: u32,
    pub data_length: u32,
}

impl From<&FisDescriptor> for TableEntry {
    fn from(desc: &FisDescriptor) -> Self {
        Self {
            name: desc.name(),
            flash_base: desc.flash_base,
            size: desc.size,
            data_length: desc.data_length,
        }
    }
}

fn print_entries(entries: &[TableEntry]) {
    println!(
        "  {:<16} {:>10} {:>10} {:>10}",
        "Name".bold(),
        "Base".bold(),
        "Size".bold(),
        "Length".bold()
    );
    for entry in entries {
        println!(
            "  {:<16} {:>#10x} {:>10} {:>10}",
            entry.name, entry.flash_base, entry.size, entry.data_length
        );
    }
}

pub fn print_table(region: &str, entries: &[TableEntry], json: bool) {
    if json {
        print_json(&json!({ "success": true, "region": region, "entries": entries }));
        return;
    }
    println!("{} {}", "Partition table:".bold(), region.dimmed());
    print_entries(entries);
}

#[derive(Debug, Serialize)]
pub struct PartitionReport {
    pub partition: String,
    pub image: Option<ImageStatus>,
    pub problem: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub flash_dir: PathBuf,
    pub table_region: String,
    pub table_version: u32,
    pub active_partition: String,
    pub target_partition: String,
    pub partitions: Vec<PartitionReport>,
    pub table: Vec<TableEntry>,
}

fn print_partition(report: &PartitionReport) {
    match &report.image {
        Some(image) => {
            let marker = if image.active {
                "●".green()
            } else {
                "○".normal()
            };
            println!(
                "  {} {} {} ({}, {:#x})",
                marker,
                report.partition.bold(),
                image.machine,
                image.soc_name,
                image.soc_id
            );
            println!("      Length:   {} bytes", image.image_len);
            if let Some(filename) = &image.filename {
                println!("      Uploaded: {}", filename);
            }
            if let Some(stage2) = &image.stage2_filename {
                println!("      Stage 2:  {}", stage2);
            }
            if let Some(metadata) = &image.metadata {
                println!("      Metadata: {}", metadata);
            }
        }
        None => println!(
            "  {} {} {}",
            "○".dimmed(),
            report.partition.bold(),
            report.problem.as_deref().unwrap_or("empty").dimmed()
        ),
    }
}

pub fn print_status(status: &StatusReport, json: bool) {
    if json {
        print_json(&json!({ "success": true, "status": status }));
        return;
    }
    println!("{} {}", "Flash bank:".bold(), status.flash_dir.display());
    println!(
        "  Running from {}, updates go to {}",
        status.active_partition.bold(),
        status.target_partition.bold()
    );
    println!("{}", "Images:".bold());
    for partition in &status.partitions {
        print_partition(partition);
    }
    println!(
        "{} {} (version {})",
        "Partition table:".bold(),
        status.table_region.dimmed(),
        status.table_version
    );
    print_entries(&status.table);
}

pub fn print_report(report: &UpdateReport, lines: &[String], json: bool) {
    if json {
        print_json(&json!({ "success": true, "report": report, "feedback": lines }));
        return;
    }
    println!(
        "{} Installed {} bytes in {}",
        "✓".green(),
        report.bytes_written,
        report.partition.bold()
    );
    match report.bootloader {
        BootloaderAction::Flashed => println!("  Bootloader updated"),
        BootloaderAction::Unchanged => println!("  Bootloader unchanged"),
        BootloaderAction::Absent => {}
    }
    if let Some(file) = &report.stage2_file {
        println!("  Stage 2 saved as {}", file);
    }
    if report.swapped {
        println!("  {} boots next", report.partition.bold());
    }
    if let Some(mode) = report.restart {
        println!("  {} restart requested", mode);
    }
}

pub fn print_update_status(status: &UpdateStatus, lines: &[String], json: bool) {
    if json {
        print_json(&json!({ "success": true, "status": status, "feedback": lines }));
        return;
    }
    println!(
        "{} {}: {}",
        "✓".green(),
        status.filename.as_deref().unwrap_or("image").bold(),
        status.message
    );
}

pub fn print_swap(primary: &str, backup: &str, json: bool) {
    if json {
        print_json(&json!({ "success": true, "swapped": [primary, backup] }));
        return;
    }
    println!(
        "{} Swapped {} and {}; the former backup boots next",
        "✓".green(),
        primary.bold(),
        backup.bold()
    );
}
