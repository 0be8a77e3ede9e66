//! Signing key generation

use std::path::Path;

use anyhow::{Context, Result};
use switchfw_crypto::{KeyFile, KeyPair};
use tracing::info;

use crate::engine::{Engine, EngineArgs};
use crate::error::CliError;
use crate::output::{self, KeyReport};

/// Generate a key pair, write its key file and optionally install the
/// public half as the firmware verification key
pub fn generate(
    output_path: &Path,
    identifier: &str,
    install: bool,
    args: &EngineArgs,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(args)?;
    let generated = KeyPair::generate().map_err(CliError::from)?;
    let keypair =
        KeyPair::from_bytes(&generated.secret_bytes(), identifier).map_err(CliError::from)?;

    KeyFile::from_keypair(&keypair)
        .save(output_path)
        .map_err(CliError::from)
        .with_context(|| format!("Failed to write key file {}", output_path.display()))?;
    info!("Wrote key file {}", output_path.display());

    let installed = if install {
        let path = engine
            .keys_dir
            .join(format!("{}.pub", engine.config.key_partition));
        std::fs::create_dir_all(&engine.keys_dir).map_err(CliError::from)?;
        let public = KeyFile::from_public_key(&keypair.public_key);
        std::fs::write(&path, format!("{}\n", public.public_key))
            .map_err(CliError::from)
            .with_context(|| format!("Failed to install {}", path.display()))?;
        info!("Installed firmware key {}", path.display());
        Some(path)
    } else {
        None
    };

    output::print_key(
        &KeyReport {
            key_file: output_path.to_path_buf(),
            identifier: keypair.public_key.identifier.clone(),
            fingerprint: keypair.public_key.fingerprint(),
            installed,
        },
        json,
    );
    Ok(())
}
