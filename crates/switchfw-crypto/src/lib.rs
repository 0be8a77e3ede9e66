//! Digest and signature primitives for switch firmware images
//!
//! This crate provides the cryptographic building blocks used to authenticate
//! firmware images before they are committed to flash:
//! - MD5 / SHA-256 / SHA-512 digests computed over a sequence of fragments
//! - Ed25519 key pairs, signing and verification of digests
//! - Installed public key lookup and key file handling
//!
//! # Architecture
//!
//! - [`digest`]: Signature type tags and fragment hashing
//! - [`ed25519`]: Ed25519 signing and verification of digests
//! - [`keystore`]: Installed key lookup and key files
//! - [`error`]: Error types for cryptographic operations
//!
//! # Security Considerations
//!
//! - MD5 checksum comparison is constant-time via the `subtle` crate
//! - MD5 is an integrity checksum only; authenticity requires a SHA type
//!
//! # Example
//!
//! ```
//! use switchfw_crypto::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = KeyPair::generate()?;
//! let digest = digest_fragments(SignatureType::Sha256, &[b"head", &[0u8; 64], b"tail"])?;
//! let signature = DigestSigner::sign(&digest, &keypair);
//! DigestVerifier::verify(&digest, signature.as_bytes(), &keypair.public_key)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod digest;
pub mod ed25519;
pub mod error;
pub mod keystore;
pub mod prelude;

pub use digest::{FragmentDigest, SignatureType, digest_fragments, md5_digest, verify_md5};
pub use ed25519::{DigestSigner, DigestVerifier, ED25519_KEY_LEN, KeyPair, PublicKey, Signature};
pub use error::{CryptoError, CryptoResult};
pub use keystore::{
    DirectoryKeyProvider, FIRMWARE_KEY_NAME, KeyFile, KeyProvider, StaticKeyProvider,
    parse_public_key,
};
