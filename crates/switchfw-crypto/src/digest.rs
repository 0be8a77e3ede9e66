//! Signature type tags and fragment hashing
//!
//! Firmware images embed their own signature, so the digest is computed over
//! several contiguous fragments (head, zeroed signature, tail) rather than one
//! buffer. Every function here therefore takes a slice of fragments.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};

/// Length of an MD5 digest in bytes
pub const MD5_LEN: usize = 16;

/// Length of an Ed25519 signature in bytes
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Signature algorithm tag carried in image headers and stage-2 records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SignatureType {
    /// No signature
    Null = 0,
    /// MD5 checksum of the signed region
    Md5 = 1,
    /// Ed25519 signature over the SHA-256 digest
    Sha256 = 2,
    /// Ed25519 signature over the SHA-512 digest
    Sha512 = 3,
}

impl SignatureType {
    /// Decode a raw tag, returning `None` for unknown values
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SignatureType::Null),
            1 => Some(SignatureType::Md5),
            2 => Some(SignatureType::Sha256),
            3 => Some(SignatureType::Sha512),
            _ => None,
        }
    }

    /// Raw tag value as stored on the wire
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Exact signature length required by this algorithm
    pub fn signature_len(self) -> Option<usize> {
        match self {
            SignatureType::Null => None,
            SignatureType::Md5 => Some(MD5_LEN),
            SignatureType::Sha256 | SignatureType::Sha512 => Some(ED25519_SIGNATURE_LEN),
        }
    }

    /// Whether verification needs an installed public key
    pub fn is_asymmetric(self) -> bool {
        matches!(self, SignatureType::Sha256 | SignatureType::Sha512)
    }

    /// Check a signature length against this algorithm
    pub fn check_signature_len(self, actual: usize) -> CryptoResult<()> {
        match self.signature_len() {
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(CryptoError::InvalidSignatureLength {
                algorithm: self.name(),
                expected,
                actual,
            }),
            None => Err(CryptoError::UnsupportedAlgorithm(self.name().to_string())),
        }
    }

    /// Short human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SignatureType::Null => "none",
            SignatureType::Md5 => "MD5",
            SignatureType::Sha256 => "SHA256",
            SignatureType::Sha512 => "SHA512",
        }
    }
}

impl std::fmt::Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Digest produced by [`digest_fragments`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentDigest {
    /// MD5 digest
    Md5([u8; MD5_LEN]),
    /// SHA-256 digest
    Sha256([u8; 32]),
    /// SHA-512 digest
    Sha512([u8; 64]),
}

impl FragmentDigest {
    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FragmentDigest::Md5(d) => d,
            FragmentDigest::Sha256(d) => d,
            FragmentDigest::Sha512(d) => d,
        }
    }

    /// Algorithm that produced this digest
    pub fn signature_type(&self) -> SignatureType {
        match self {
            FragmentDigest::Md5(_) => SignatureType::Md5,
            FragmentDigest::Sha256(_) => SignatureType::Sha256,
            FragmentDigest::Sha512(_) => SignatureType::Sha512,
        }
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

fn hash_all<D: Digest>(fragments: &[&[u8]]) -> D {
    let mut hasher = D::new();
    for fragment in fragments {
        hasher.update(fragment);
    }
    hasher
}

/// Compute a digest over `fragments` in order
///
/// # Errors
///
/// Returns [`CryptoError::UnsupportedAlgorithm`] for [`SignatureType::Null`].
pub fn digest_fragments(kind: SignatureType, fragments: &[&[u8]]) -> CryptoResult<FragmentDigest> {
    match kind {
        SignatureType::Md5 => {
            let mut out = [0u8; MD5_LEN];
            out.copy_from_slice(&hash_all::<Md5>(fragments).finalize());
            Ok(FragmentDigest::Md5(out))
        }
        SignatureType::Sha256 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&hash_all::<Sha256>(fragments).finalize());
            Ok(FragmentDigest::Sha256(out))
        }
        SignatureType::Sha512 => {
            let mut out = [0u8; 64];
            out.copy_from_slice(&hash_all::<Sha512>(fragments).finalize());
            Ok(FragmentDigest::Sha512(out))
        }
        SignatureType::Null => Err(CryptoError::UnsupportedAlgorithm(
            "no digest for unsigned type".to_string(),
        )),
    }
}

/// MD5 of a single buffer
pub fn md5_digest(data: &[u8]) -> [u8; MD5_LEN] {
    let mut out = [0u8; MD5_LEN];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// Compare the MD5 of `fragments` with `expected` in constant time
///
/// # Errors
///
/// Returns an error if `expected` is not 16 bytes or the checksum differs.
pub fn verify_md5(fragments: &[&[u8]], expected: &[u8]) -> CryptoResult<()> {
    SignatureType::Md5.check_signature_len(expected.len())?;
    let computed = hash_all::<Md5>(fragments).finalize();
    if bool::from(computed.as_slice().ct_eq(expected)) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature("MD5 checksum mismatch".to_string()))
    }
}
