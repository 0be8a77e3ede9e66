//! Command implementations for switchfwctl

pub mod flash;
pub mod image;
pub mod keys;
pub mod upgrade;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use switchfw_crypto::SignatureType;
use switchfw_update::RestartMode;

use crate::engine::{parse_size, parse_u32};
use crate::error::CliError;

/// Read an input file
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(CliError::from)
        .with_context(|| format!("Failed to read {}", path.display()))
}

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Assemble and sign a firmware image
    Build(BuildArgs),

    /// Show the header and records of an image file
    Inspect {
        /// Image file
        image: PathBuf,
        /// Check the image against the installed key and chip family
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Args)]
pub struct BuildArgs {
    /// Target board machine name
    #[arg(long)]
    pub machine: String,
    /// Chip family identifier
    #[arg(long, value_parser = parse_u32)]
    pub soc_id: u32,
    /// SoC name
    #[arg(long, default_value = "")]
    pub soc_name: String,
    /// Kernel payload
    #[arg(long)]
    pub kernel: PathBuf,
    /// Initial ramdisk
    #[arg(long)]
    pub initrd: Option<PathBuf>,
    /// Kernel command line
    #[arg(long)]
    pub cmdline: Option<String>,
    /// Free-form metadata record
    #[arg(long)]
    pub metadata: Option<String>,
    /// Signature scheme
    #[arg(long, value_enum, default_value_t = SignatureArg::Md5)]
    pub signature: SignatureArg,
    /// Key file holding the signing key (sha256/sha512)
    #[arg(long)]
    pub key: Option<PathBuf>,
    /// Bootloader to carry as a stage-2 record
    #[arg(long)]
    pub bootloader: Option<PathBuf>,
    /// Secondary root filesystem to carry as a stage-2 record
    #[arg(long)]
    pub rootfs: Option<PathBuf>,
    /// Name under which the stage-2 trailer is persisted
    #[arg(long)]
    pub stage2_name: Option<String>,
    /// Image file to write
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Subcommand)]
pub enum FlashCommands {
    /// Create the flash regions and format the partition table
    Init {
        /// Size of each firmware partition
        #[arg(long, value_parser = parse_size, default_value = "4M")]
        image_size: u32,
        /// Size of the boot loader partition
        #[arg(long, value_parser = parse_size, default_value = "256K")]
        bootloader_size: u32,
        /// Create only the primary firmware partition
        #[arg(long)]
        no_backup: bool,
        /// Recreate regions that already exist
        #[arg(short, long)]
        force: bool,
    },

    /// List the entries of the partition table
    List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SignatureArg {
    /// Unsigned
    None,
    /// MD5 checksum
    Md5,
    /// Ed25519 over SHA-256
    Sha256,
    /// Ed25519 over SHA-512
    Sha512,
}

impl SignatureArg {
    pub fn signature_type(self) -> SignatureType {
        match self {
            SignatureArg::None => SignatureType::Null,
            SignatureArg::Md5 => SignatureType::Md5,
            SignatureArg::Sha256 => SignatureType::Sha256,
            SignatureArg::Sha512 => SignatureType::Sha512,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RestartArg {
    /// Full power cycle
    Cold,
    /// Restart without resetting the switch core
    Cool,
    /// Software restart only
    Warm,
}

impl RestartArg {
    pub fn mode(self) -> RestartMode {
        match self {
            RestartArg::Cold => RestartMode::Cold,
            RestartArg::Cool => RestartMode::Cool,
            RestartArg::Warm => RestartMode::Warm,
        }
    }
}
