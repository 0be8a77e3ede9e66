//! Firmware update configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FirmwareError, FirmwareResult};

/// Default maximum firmware download size (40 MiB)
pub const DEFAULT_MAX_DOWNLOAD_SIZE: usize = 40 * 1024 * 1024;

/// Default idle timeout for chunked upload sessions
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of the running system, used for image compatibility checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemIdentity {
    /// Chip family identifier images must declare
    pub soc_family: u32,
    /// Board machine name; when unset the machine name of the installed
    /// primary image is used, and when that is unreadable any machine matches
    pub machine: Option<String>,
}

/// Firmware update configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Accept images whose header declares no signature
    pub allow_unsigned: bool,
    /// Require SHA signatures on stage-2 bootloader and root filesystem
    /// records; filename records stay MD5 since the switch writes them itself
    pub enforce_pki: bool,
    /// Maximum size of an assembled download in bytes
    pub max_download_size: usize,
    /// Idle timeout applied to chunked sessions when the caller gives none
    #[serde(with = "duration_millis")]
    pub session_timeout: Duration,
    /// Primary firmware partition
    pub primary_partition: String,
    /// Backup firmware partition for A/B layouts
    pub backup_partition: Option<String>,
    /// Flash region holding the primary partition table
    pub primary_table: String,
    /// Flash region holding the redundant partition table
    pub redundant_table: String,
    /// Boot loader partition
    pub bootloader_partition: String,
    /// Name of the installed firmware verification key
    pub key_partition: String,
    /// Running system identity
    pub system: SystemIdentity,
    /// Stage downloads in temporary files under this directory
    pub staging_dir: Option<PathBuf>,
    /// Persist stage-2 trailers under this directory
    pub stage2_dir: Option<PathBuf>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            allow_unsigned: false,
            enforce_pki: false,
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            primary_partition: "linux".to_string(),
            backup_partition: Some("linux.bk".to_string()),
            primary_table: "FIS_directory".to_string(),
            redundant_table: "Redundant_FIS".to_string(),
            bootloader_partition: "RedBoot".to_string(),
            key_partition: switchfw_crypto::FIRMWARE_KEY_NAME.to_string(),
            system: SystemIdentity::default(),
            staging_dir: None,
            stage2_dir: None,
        }
    }
}

impl FirmwareConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> FirmwareResult<()> {
        if self.max_download_size == 0 {
            return Err(FirmwareError::config(
                "max_download_size must be greater than 0",
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(FirmwareError::config(
                "session_timeout must be greater than 0",
            ));
        }
        let names = [
            ("primary_partition", &self.primary_partition),
            ("primary_table", &self.primary_table),
            ("redundant_table", &self.redundant_table),
            ("bootloader_partition", &self.bootloader_partition),
            ("key_partition", &self.key_partition),
        ];
        for (field, value) in names {
            if value.is_empty() {
                return Err(FirmwareError::config(format!("{} must not be empty", field)));
            }
        }
        if self.primary_table == self.redundant_table {
            return Err(FirmwareError::config(
                "primary_table and redundant_table must differ",
            ));
        }
        match &self.backup_partition {
            Some(backup) if backup.is_empty() => Err(FirmwareError::config(
                "backup_partition must not be empty",
            )),
            Some(backup) if *backup == self.primary_partition => Err(FirmwareError::config(
                "backup_partition must differ from primary_partition",
            )),
            _ => Ok(()),
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> FirmwareResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> FirmwareResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> FirmwareConfigBuilder {
        FirmwareConfigBuilder::default()
    }
}

/// Builder for `FirmwareConfig`.
#[derive(Debug, Default)]
pub struct FirmwareConfigBuilder {
    config: FirmwareConfig,
}

impl FirmwareConfigBuilder {
    /// Accept unsigned images.
    #[must_use]
    pub fn allow_unsigned(mut self, allow: bool) -> Self {
        self.config.allow_unsigned = allow;
        self
    }

    /// Require SHA-signed stage-2 payload records.
    #[must_use]
    pub fn enforce_pki(mut self, enforce: bool) -> Self {
        self.config.enforce_pki = enforce;
        self
    }

    /// Set the maximum download size in bytes.
    #[must_use]
    pub fn max_download_size(mut self, bytes: usize) -> Self {
        self.config.max_download_size = bytes;
        self
    }

    /// Set the default session idle timeout.
    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Set the primary firmware partition name.
    #[must_use]
    pub fn primary_partition(mut self, name: impl Into<String>) -> Self {
        self.config.primary_partition = name.into();
        self
    }

    /// Set or clear the backup firmware partition name.
    #[must_use]
    pub fn backup_partition(mut self, name: Option<String>) -> Self {
        self.config.backup_partition = name;
        self
    }

    /// Set the partition table region names.
    #[must_use]
    pub fn tables(mut self, primary: impl Into<String>, redundant: impl Into<String>) -> Self {
        self.config.primary_table = primary.into();
        self.config.redundant_table = redundant.into();
        self
    }

    /// Set the boot loader partition name.
    #[must_use]
    pub fn bootloader_partition(mut self, name: impl Into<String>) -> Self {
        self.config.bootloader_partition = name.into();
        self
    }

    /// Set the running chip family.
    #[must_use]
    pub fn soc_family(mut self, soc_family: u32) -> Self {
        self.config.system.soc_family = soc_family;
        self
    }

    /// Override the board machine name.
    #[must_use]
    pub fn machine(mut self, machine: impl Into<String>) -> Self {
        self.config.system.machine = Some(machine.into());
        self
    }

    /// Stage downloads on disk under `dir`.
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = Some(dir.into());
        self
    }

    /// Persist stage-2 trailers under `dir`.
    #[must_use]
    pub fn stage2_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.stage2_dir = Some(dir.into());
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> FirmwareResult<FirmwareConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
