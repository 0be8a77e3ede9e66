//! Prelude for switchfw-crypto
//!
//! Re-exports the most commonly used types and functions.

pub use crate::digest::{FragmentDigest, SignatureType, digest_fragments, md5_digest, verify_md5};
pub use crate::ed25519::{DigestSigner, DigestVerifier, KeyPair, PublicKey, Signature};
pub use crate::error::{CryptoError, CryptoResult};
pub use crate::keystore::{
    DirectoryKeyProvider, FIRMWARE_KEY_NAME, KeyFile, KeyProvider, StaticKeyProvider,
    parse_public_key,
};
