//! Ed25519 signing and verification of image digests
//!
//! SHA-typed firmware images carry a 64-byte Ed25519 signature computed over
//! the SHA-256 or SHA-512 digest of the signed region, not over the raw bytes.
//! Key and signature comparisons run in constant time.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::digest::{ED25519_SIGNATURE_LEN, FragmentDigest};
use crate::error::{CryptoError, CryptoResult};

/// Length of an Ed25519 public or secret key
pub const ED25519_KEY_LEN: usize = 32;

/// Installed firmware verification key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    /// Compressed Edwards point
    pub key_bytes: [u8; ED25519_KEY_LEN],
    /// Name the key is installed under
    pub identifier: String,
}

impl PublicKey {
    /// Wrap raw key bytes; the point is checked lazily on first use
    pub fn from_bytes(key_bytes: [u8; ED25519_KEY_LEN], identifier: impl Into<String>) -> Self {
        Self {
            key_bytes,
            identifier: identifier.into(),
        }
    }

    /// Hex SHA-256 of the key bytes, as shown by `switchfwctl keygen`
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key_bytes))
    }

    /// Decode the point, failing for bytes that are not a valid key
    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key_bytes).map_err(|e| {
            CryptoError::KeyFormatError(format!("{} is not an Ed25519 key: {}", self.identifier, e))
        })
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.key_bytes.ct_eq(&other.key_bytes))
    }
}

impl Eq for PublicKey {}

/// 64-byte signature stored in a SIGNATURE TLV or stage-2 record
#[derive(Debug, Clone, Copy)]
pub struct Signature([u8; ED25519_SIGNATURE_LEN]);

impl Signature {
    /// Take a signature out of an image, checking its length
    pub fn from_slice(raw: &[u8]) -> CryptoResult<Self> {
        match <[u8; ED25519_SIGNATURE_LEN]>::try_from(raw) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(_) => Err(CryptoError::InvalidSignatureLength {
                algorithm: "Ed25519",
                expected: ED25519_SIGNATURE_LEN,
                actual: raw.len(),
            }),
        }
    }

    /// Bytes to embed in the image
    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_LEN] {
        &self.0
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for Signature {}

/// Signing key held by the image builder
#[derive(Debug)]
pub struct KeyPair {
    secret: SigningKey,
    /// Half that gets installed on the switch
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Fresh key from the OS random source, named after the firmware key slot
    pub fn generate() -> CryptoResult<Self> {
        let secret = SigningKey::generate(&mut OsRng);
        Ok(Self::with_secret(secret, "fwkey"))
    }

    /// Rebuild a key pair from a stored 32-byte secret
    pub fn from_bytes(
        secret: &[u8; ED25519_KEY_LEN],
        identifier: impl Into<String>,
    ) -> CryptoResult<Self> {
        Ok(Self::with_secret(SigningKey::from_bytes(secret), identifier))
    }

    fn with_secret(secret: SigningKey, identifier: impl Into<String>) -> Self {
        let public_key = PublicKey::from_bytes(secret.verifying_key().to_bytes(), identifier);
        Self { secret, public_key }
    }

    /// Secret half, for writing key files
    pub fn secret_bytes(&self) -> [u8; ED25519_KEY_LEN] {
        self.secret.to_bytes()
    }
}

/// Signs image digests
pub struct DigestSigner;

impl DigestSigner {
    /// Sign the bytes of `digest`
    pub fn sign(digest: &FragmentDigest, keypair: &KeyPair) -> Signature {
        Signature(keypair.secret.sign(digest.as_bytes()).to_bytes())
    }
}

/// Verifies image digests against an installed public key
pub struct DigestVerifier;

impl DigestVerifier {
    /// Verify `signature` over the bytes of `digest`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignatureLength`] for a signature that is
    /// not 64 bytes, [`CryptoError::KeyFormatError`] for a malformed key, and
    /// [`CryptoError::InvalidSignature`] when verification fails.
    pub fn verify(
        digest: &FragmentDigest,
        signature: &[u8],
        public_key: &PublicKey,
    ) -> CryptoResult<()> {
        let signature = Signature::from_slice(signature)?;
        let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        public_key
            .to_verifying_key()?
            .verify(digest.as_bytes(), &signature)
            .map_err(|e| {
                tracing::debug!(
                    "Ed25519 verification failed for {} digest: {}",
                    digest.signature_type(),
                    e
                );
                CryptoError::InvalidSignature(format!(
                    "{} signature does not verify against key {}",
                    digest.signature_type(),
                    public_key.identifier
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{SignatureType, digest_fragments};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_sign_and_verify_sha512() -> TestResult {
        let keypair = KeyPair::generate()?;
        let digest = digest_fragments(SignatureType::Sha512, &[b"firmware"])?;
        let signature = DigestSigner::sign(&digest, &keypair);
        DigestVerifier::verify(&digest, signature.as_bytes(), &keypair.public_key)?;
        Ok(())
    }

    #[test]
    fn test_verify_rejects_other_key() -> TestResult {
        let signer = KeyPair::generate()?;
        let other = KeyPair::generate()?;
        let digest = digest_fragments(SignatureType::Sha256, &[b"firmware"])?;
        let signature = DigestSigner::sign(&digest, &signer);
        let result = DigestVerifier::verify(&digest, signature.as_bytes(), &other.public_key);
        assert!(matches!(result, Err(CryptoError::InvalidSignature(_))));
        Ok(())
    }

    #[test]
    fn test_from_bytes_is_deterministic() -> TestResult {
        let a = KeyPair::from_bytes(&[7u8; 32], "a")?;
        let b = KeyPair::from_bytes(&[7u8; 32], "b")?;
        assert_eq!(a.public_key.key_bytes, b.public_key.key_bytes);
        assert_eq!(a.public_key.fingerprint().len(), 64);
        Ok(())
    }

    #[test]
    fn test_short_signature_rejected() -> TestResult {
        let keypair = KeyPair::generate()?;
        let digest = digest_fragments(SignatureType::Sha256, &[b"x"])?;
        let result = DigestVerifier::verify(&digest, &[0u8; 63], &keypair.public_key);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidSignatureLength { actual: 63, .. })
        ));
        Ok(())
    }
}
