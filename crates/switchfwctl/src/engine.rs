//! Engine wiring from the global command-line options

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use switchfw_crypto::DirectoryKeyProvider;
use switchfw_update::flash::DEFAULT_ERASE_SIZE;
use switchfw_update::{
    FileFlashBank, FirmwareConfig, FirmwareService, FixedActiveImage, FlashProvider, Orchestrator,
};
use tracing::debug;

use crate::error::CliError;

/// Options locating the flash bank, keys and configuration
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Directory holding the file-backed flash regions
    #[arg(long, global = true, env = "SWITCHFW_FLASH_DIR", default_value = "flash")]
    pub flash_dir: PathBuf,

    /// Erase block size of the flash regions
    #[arg(long, global = true, default_value_t = DEFAULT_ERASE_SIZE, value_parser = parse_u32)]
    pub erase_size: u32,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "SWITCHFW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of installed public keys [default: <flash-dir>/keys]
    #[arg(long, global = true)]
    pub keys: Option<PathBuf>,

    /// Partition the system booted from
    #[arg(long, global = true)]
    pub active: Option<String>,

    /// Chip family of the running system
    #[arg(long, global = true, value_parser = parse_u32)]
    pub soc_family: Option<u32>,

    /// Accept images that carry no signature
    #[arg(long, global = true)]
    pub allow_unsigned: bool,

    /// Require SHA signatures on stage-2 bootloader and rootfs records
    #[arg(long, global = true)]
    pub enforce_pki: bool,
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_u32(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", text, e))
}

/// Parse a byte count with an optional `K` or `M` suffix
pub fn parse_size(text: &str) -> Result<u32, String> {
    let (digits, scale) = match text.strip_suffix(['K', 'k']) {
        Some(digits) => (digits, 1024u32),
        None => match text.strip_suffix(['M', 'm']) {
            Some(digits) => (digits, 1024 * 1024),
            None => (text, 1),
        },
    };
    parse_u32(digits)?
        .checked_mul(scale)
        .ok_or_else(|| format!("size '{}' does not fit in 32 bits", text))
}

/// The flash bank and engine configuration selected on the command line
#[derive(Debug)]
pub struct Engine {
    pub bank: FileFlashBank,
    pub config: FirmwareConfig,
    pub keys_dir: PathBuf,
    active: Option<String>,
}

impl Engine {
    /// Resolve the global options
    pub fn open(args: &EngineArgs) -> Result<Self, CliError> {
        let mut config = match &args.config {
            Some(path) => FirmwareConfig::load(path)?,
            None => FirmwareConfig::default(),
        };
        if let Some(soc_family) = args.soc_family {
            config.system.soc_family = soc_family;
        }
        if args.allow_unsigned {
            config.allow_unsigned = true;
        }
        if args.enforce_pki {
            config.enforce_pki = true;
        }
        config
            .validate()
            .map_err(|e| CliError::InvalidConfiguration(e.to_string()))?;

        let keys_dir = args
            .keys
            .clone()
            .unwrap_or_else(|| args.flash_dir.join("keys"));
        debug!(
            "Flash bank {} (erase size {}), keys in {}",
            args.flash_dir.display(),
            args.erase_size,
            keys_dir.display()
        );
        Ok(Self {
            bank: FileFlashBank::new(&args.flash_dir, args.erase_size),
            config,
            keys_dir,
            active: args.active.clone(),
        })
    }

    /// Bank directory
    pub fn flash_dir(&self) -> &Path {
        self.bank.dir()
    }

    /// Fail unless the partition table regions exist
    pub fn require_initialized(&self) -> Result<(), CliError> {
        for table in [&self.config.primary_table, &self.config.redundant_table] {
            if !self.bank.exists(table) {
                return Err(CliError::NotInitialized(format!(
                    "{} has no {} region, run `switchfwctl flash init`",
                    self.flash_dir().display(),
                    table
                )));
            }
        }
        Ok(())
    }

    /// Orchestrator over the bank
    pub fn orchestrator(&self) -> Orchestrator {
        let active = match &self.active {
            Some(partition) => FixedActiveImage::new(partition.clone()),
            None => FixedActiveImage::unknown(),
        };
        Orchestrator::new(
            self.config.clone(),
            Arc::new(self.bank.clone()),
            Arc::new(DirectoryKeyProvider::new(&self.keys_dir)),
        )
        .with_active_image(Arc::new(active))
    }

    /// Running engine over an initialized bank
    pub fn service(&self) -> Result<FirmwareService, CliError> {
        self.require_initialized()?;
        Ok(FirmwareService::new(self.orchestrator())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_parse_in_both_radixes() {
        assert_eq!(parse_u32("29800"), Ok(29800));
        assert_eq!(parse_u32("0x7468"), Ok(0x7468));
        assert_eq!(parse_u32("0X10"), Ok(16));
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("").is_err());
    }

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_size("4m"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("0x100"), Ok(256));
        assert!(parse_size("8192M").is_err());
    }

    #[test]
    fn missing_tables_report_not_initialized() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let args = EngineArgs {
            flash_dir: dir.path().to_path_buf(),
            erase_size: 4096,
            config: None,
            keys: None,
            active: None,
            soc_family: Some(0x7468),
            allow_unsigned: false,
            enforce_pki: true,
        };
        let engine = Engine::open(&args)?;
        assert_eq!(engine.keys_dir, dir.path().join("keys"));
        assert_eq!(engine.config.system.soc_family, 0x7468);
        assert!(engine.config.enforce_pki);
        assert!(matches!(
            engine.require_initialized(),
            Err(CliError::NotInitialized(_))
        ));
        Ok(())
    }
}
