//! Image building and inspection commands

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use switchfw_crypto::{DirectoryKeyProvider, KeyFile, SignatureType};
use switchfw_update::image::{Stage2Type, Stage2Walker, image_md5_hex};
use switchfw_update::{
    FirmwareError, ImageBuilder, ImageHeader, ImageValidator, Stage2Record, TlvType,
};
use tracing::{info, warn};

use crate::commands::{BuildArgs, ImageCommands, read_file};
use crate::engine::{Engine, EngineArgs};
use crate::error::CliError;
use crate::output::{self, BuildReport, Inspection, RecordInfo};

/// Execute image command
pub fn execute(cmd: &ImageCommands, args: &EngineArgs, json: bool) -> Result<()> {
    match cmd {
        ImageCommands::Build(build_args) => build(build_args, json),
        ImageCommands::Inspect { image, verify } => inspect(image, *verify, args, json),
    }
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn build(args: &BuildArgs, json: bool) -> Result<()> {
    let kind = args.signature.signature_type();
    let mut builder = ImageBuilder::new(&args.machine, args.soc_id)
        .soc_name(&args.soc_name)
        .kernel(read_file(&args.kernel)?)
        .signature(kind);

    if let Some(path) = &args.initrd {
        builder = builder.tlv(TlvType::Initrd, read_file(path)?);
    }
    if let Some(cmdline) = &args.cmdline {
        builder = builder.tlv(TlvType::KernelCmd, nul_terminated(cmdline));
    }
    if let Some(metadata) = &args.metadata {
        builder = builder.tlv(TlvType::Metadata, nul_terminated(metadata));
    }

    match (&args.key, kind.is_asymmetric()) {
        (Some(path), true) => {
            let keypair = KeyFile::load(path)
                .and_then(|file| file.keypair())
                .map_err(CliError::from)?;
            builder = builder.signing_key(keypair);
        }
        (None, true) => {
            return Err(CliError::InvalidArgument(format!("{} signing needs --key", kind)).into());
        }
        (Some(_), false) => warn!("--key is not used by {} images", kind),
        (None, false) => {}
    }

    if let Some(path) = &args.bootloader {
        builder = builder.stage2(Stage2Record::bootloader(read_file(path)?));
    }
    if let Some(path) = &args.rootfs {
        builder = builder.stage2(Stage2Record::rootfs(read_file(path)?));
    }
    if let Some(name) = &args.stage2_name {
        builder = builder.stage2_filename(name);
    }

    let image = builder.build().map_err(CliError::from)?;
    std::fs::write(&args.output, &image).map_err(CliError::from)?;
    info!("Wrote {} byte image to {}", image.len(), args.output.display());

    output::print_build(
        &BuildReport {
            output: args.output.clone(),
            size: image.len(),
            md5: image_md5_hex(&image),
            signature: kind.to_string(),
        },
        json,
    );
    Ok(())
}

fn type_name(kind: Option<impl std::fmt::Debug>, raw: u32) -> String {
    match kind {
        Some(kind) => format!("{:?}", kind).to_lowercase(),
        None => format!("unknown({})", raw),
    }
}

fn signature_name(raw: u32) -> String {
    SignatureType::from_raw(raw).map_or_else(|| format!("unknown({})", raw), |k| k.to_string())
}

fn inspect(path: &Path, verify: bool, args: &EngineArgs, json: bool) -> Result<()> {
    let data = read_file(path)?;
    let header = ImageHeader::parse(&data).map_err(FirmwareError::from).map_err(CliError::from)?;

    let mut problems = Vec::new();
    if !header.has_valid_magic() {
        problems.push(format!("bad magic {:#010x} {:#010x}", header.magic1, header.magic2));
    }
    let mut records = Vec::new();
    for record in header.tlvs(&data) {
        match record {
            Ok(view) => records.push(RecordInfo {
                kind: type_name(TlvType::from_raw(view.kind), view.kind),
                offset: view.offset,
                length: view.data_len,
                signature: None,
                name: None,
            }),
            Err(e) => problems.push(e.to_string()),
        }
    }

    let stage1_len = header.image_len().min(data.len());
    let trailer = data.get(stage1_len..).unwrap_or_default();
    let mut stage2 = Vec::new();
    for record in Stage2Walker::new(trailer, None) {
        match record {
            Ok(tlv) => stage2.push(RecordInfo {
                kind: type_name(Some(tlv.kind), tlv.kind.as_raw()),
                offset: stage1_len.saturating_add(tlv.offset),
                length: tlv.data_len,
                signature: Some(tlv.signature_type.to_string()),
                name: (tlv.kind == Stage2Type::Filename).then(|| tlv.name(trailer)),
            }),
            Err(e) => problems.push(e.to_string()),
        }
    }

    let verified = if verify {
        let engine = Engine::open(args)?;
        let mut config = engine.config.clone();
        if args.soc_family.is_none() && args.config.is_none() {
            config.system.soc_family = header.soc_id;
        }
        let validator =
            ImageValidator::new(Arc::new(DirectoryKeyProvider::new(&engine.keys_dir)), &config);
        validator.check_image(&data, None).map_err(CliError::from)?;
        Some(true)
    } else {
        None
    };

    output::print_inspection(
        &Inspection {
            file: path.to_path_buf(),
            size: data.len(),
            md5: image_md5_hex(&data),
            version: header.version,
            machine: header.machine_name(),
            soc_name: header.soc_name(),
            soc_id: header.soc_id,
            image_len: header.image_len,
            signature: signature_name(header.signature_type),
            records,
            stage2,
            problems,
            verified,
        },
        json,
    );
    Ok(())
}
