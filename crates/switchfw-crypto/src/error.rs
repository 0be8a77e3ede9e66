//! Errors raised while hashing, signing or loading keys

use thiserror::Error;

/// Failure of a digest, signature or key operation
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Signature did not verify against the installed key or checksum
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Signature field is the wrong size for its scheme
    #[error("{algorithm} signature must be {expected} bytes, found {actual}")]
    InvalidSignatureLength {
        /// Scheme the length was checked against
        algorithm: &'static str,
        /// Required size
        expected: usize,
        /// Size found in the image
        actual: usize,
    },

    /// Signature type tag that cannot produce a digest
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key material could not be parsed
    #[error("Malformed key: {0}")]
    KeyFormatError(String),

    /// No public key has been installed on this system
    #[error("No firmware authentication key installed")]
    KeyNotInstalled,

    /// Key file is not valid JSON
    #[error("Key file encoding: {0}")]
    KeyFileEncoding(#[from] serde_json::Error),

    /// Reading or writing a key file failed
    #[error("Key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crypto crate
pub type CryptoResult<T> = Result<T, CryptoError>;
