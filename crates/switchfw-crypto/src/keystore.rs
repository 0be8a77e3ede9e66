//! Installed key lookup and key files
//!
//! The validator asks a [`KeyProvider`] for a named public key (the firmware
//! key is installed as `fwkey`). Keys may be stored as raw 32-byte blobs,
//! hex, or base64 text. Stored blobs are often padded with NUL or erased-flash
//! `0xFF` bytes, which [`parse_public_key`] strips.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::ed25519::{ED25519_KEY_LEN, KeyPair, PublicKey};
use crate::error::{CryptoError, CryptoResult};

/// Name under which the firmware verification key is installed
pub const FIRMWARE_KEY_NAME: &str = "fwkey";

/// Source of installed public keys
pub trait KeyProvider: Send + Sync {
    /// Look up a public key by name
    fn public_key(&self, name: &str) -> CryptoResult<Option<PublicKey>>;
}

/// In-memory key provider
#[derive(Debug, Default, Clone)]
pub struct StaticKeyProvider {
    keys: HashMap<String, PublicKey>,
}

impl StaticKeyProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding a single firmware key
    pub fn with_firmware_key(key: PublicKey) -> Self {
        let mut provider = Self::new();
        provider.install(FIRMWARE_KEY_NAME, key);
        provider
    }

    /// Install or replace a key
    pub fn install(&mut self, name: impl Into<String>, key: PublicKey) {
        self.keys.insert(name.into(), key);
    }

    /// Remove a key, returning it if present
    pub fn remove(&mut self, name: &str) -> Option<PublicKey> {
        self.keys.remove(name)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn public_key(&self, name: &str) -> CryptoResult<Option<PublicKey>> {
        Ok(self.keys.get(name).cloned())
    }
}

/// Key provider reading `<dir>/<name>.pub` files
#[derive(Debug, Clone)]
pub struct DirectoryKeyProvider {
    dir: PathBuf,
}

impl DirectoryKeyProvider {
    /// Create a provider rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pub", name))
    }
}

impl KeyProvider for DirectoryKeyProvider {
    fn public_key(&self, name: &str) -> CryptoResult<Option<PublicKey>> {
        let path = self.key_path(name);
        match std::fs::read(&path) {
            Ok(blob) => parse_public_key(&blob, name).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::Io(e)),
        }
    }
}

fn trim_padding(blob: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| *b == 0 || *b == 0xFF || b.is_ascii_whitespace();
    let start = blob.iter().position(|b| !is_pad(b)).unwrap_or(blob.len());
    let end = blob
        .iter()
        .rposition(|b| !is_pad(b))
        .map_or(start, |pos| pos.saturating_add(1));
    blob.get(start..end).unwrap_or_default()
}

/// Parse a stored public key blob
///
/// Accepts exactly 32 raw bytes, 64 hex characters, or base64 text. Leading
/// and trailing NUL, `0xFF` and whitespace bytes are ignored for the textual
/// forms.
pub fn parse_public_key(blob: &[u8], identifier: &str) -> CryptoResult<PublicKey> {
    if let Ok(raw) = <[u8; ED25519_KEY_LEN]>::try_from(blob) {
        return Ok(PublicKey::from_bytes(raw, identifier));
    }

    let text = std::str::from_utf8(trim_padding(blob))
        .map_err(|e| CryptoError::KeyFormatError(format!("key is neither raw nor text: {}", e)))?;

    let decoded = if text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(text).map_err(|e| CryptoError::KeyFormatError(e.to_string()))?
    } else {
        STANDARD
            .decode(text)
            .map_err(|e| CryptoError::KeyFormatError(format!("invalid base64: {}", e)))?
    };

    let Ok(key_bytes) = <[u8; ED25519_KEY_LEN]>::try_from(decoded.as_slice()) else {
        return Err(CryptoError::KeyFormatError(format!(
            "expected 32 key bytes, got {}",
            decoded.len()
        )));
    };

    let key = PublicKey::from_bytes(key_bytes, identifier);
    key.to_verifying_key()?;
    Ok(key)
}

/// JSON key file written by the tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    /// Key identifier
    pub identifier: String,
    /// Base64 public key
    pub public_key: String,
    /// Base64 signing key, absent for public-only files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

impl KeyFile {
    /// Key file holding both halves of `keypair`
    pub fn from_keypair(keypair: &KeyPair) -> Self {
        Self {
            identifier: keypair.public_key.identifier.clone(),
            public_key: STANDARD.encode(keypair.public_key.key_bytes),
            signing_key: Some(STANDARD.encode(keypair.secret_bytes())),
        }
    }

    /// Key file holding only a public key
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            identifier: key.identifier.clone(),
            public_key: STANDARD.encode(key.key_bytes),
            signing_key: None,
        }
    }

    /// Decode the public key
    pub fn public_key(&self) -> CryptoResult<PublicKey> {
        parse_public_key(self.public_key.as_bytes(), &self.identifier)
    }

    /// Decode the key pair
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFormatError`] when the file holds no signing
    /// key or the signing key does not match the stored public key.
    pub fn keypair(&self) -> CryptoResult<KeyPair> {
        let encoded = self.signing_key.as_deref().ok_or_else(|| {
            CryptoError::KeyFormatError(format!("{} has no signing key", self.identifier))
        })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::KeyFormatError(format!("invalid base64: {}", e)))?;
        let Ok(secret) = <[u8; ED25519_KEY_LEN]>::try_from(bytes.as_slice()) else {
            return Err(CryptoError::KeyFormatError(format!(
                "expected 32 signing key bytes, got {}",
                bytes.len()
            )));
        };
        let keypair = KeyPair::from_bytes(&secret, self.identifier.clone())?;
        if keypair.public_key != self.public_key()? {
            return Err(CryptoError::KeyFormatError(
                "signing key does not match public key".to_string(),
            ));
        }
        Ok(keypair)
    }

    /// Write the key file as pretty JSON
    pub fn save(&self, path: &Path) -> CryptoResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a key file
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
