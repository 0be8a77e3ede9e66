//! Structural and cryptographic image validation

use std::sync::Arc;

use switchfw_crypto::{
    CryptoError, DigestVerifier, KeyProvider, SignatureType, digest_fragments, verify_md5,
};
use tracing::{debug, info, warn};

use super::stage2::{Stage2Tlv, Stage2Type, last_bootloader, stage2_records};
use super::{ImageHeader, TlvType, check_header, find_tlv};
use crate::config::FirmwareConfig;
use crate::error::{FirmwareError, FirmwareResult, ImageError};
use crate::tlv::TlvView;

/// What validation learned about an accepted image
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Decoded header
    pub header: ImageHeader,
    /// Kernel record
    pub kernel: TlvView,
    /// Length of the stage-1 image
    pub stage1_len: usize,
    /// Stage-2 records, offsets relative to the start of the trailer
    pub stage2: Vec<Stage2Tlv>,
}

impl ImageInfo {
    /// Whether the image carries a stage-2 trailer
    pub fn has_stage2(&self) -> bool {
        !self.stage2.is_empty()
    }

    /// Last bootloader record of the trailer
    pub fn bootloader(&self) -> Option<&Stage2Tlv> {
        last_bootloader(&self.stage2)
    }
}

/// Checks images against the running system and the installed key
#[derive(Clone)]
pub struct ImageValidator {
    keys: Arc<dyn KeyProvider>,
    key_name: String,
    allow_unsigned: bool,
    enforce_pki: bool,
    soc_family: u32,
}

impl std::fmt::Debug for ImageValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageValidator")
            .field("key_name", &self.key_name)
            .field("allow_unsigned", &self.allow_unsigned)
            .field("enforce_pki", &self.enforce_pki)
            .field("soc_family", &self.soc_family)
            .finish_non_exhaustive()
    }
}

impl ImageValidator {
    /// Validator for the system described by `config`
    pub fn new(keys: Arc<dyn KeyProvider>, config: &FirmwareConfig) -> Self {
        Self {
            keys,
            key_name: config.key_partition.clone(),
            allow_unsigned: config.allow_unsigned,
            enforce_pki: config.enforce_pki,
            soc_family: config.system.soc_family,
        }
    }

    /// Chip family images must target
    pub fn soc_family(&self) -> u32 {
        self.soc_family
    }

    /// Whether unsigned images are accepted
    pub fn allows_unsigned(&self) -> bool {
        self.allow_unsigned
    }

    /// Check that a stage-2 record's scheme is acceptable for its type
    ///
    /// With PKI enforced, bootloader and root filesystem records must carry
    /// an Ed25519 signature. Filename records are exempt: the switch adds
    /// them itself, MD5-signed, when it stores an upload.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` for a keyless payload record.
    pub fn check_stage2_scheme(
        &self,
        kind: Stage2Type,
        signature_type: SignatureType,
    ) -> FirmwareResult<()> {
        if self.enforce_pki && kind != Stage2Type::Filename && !signature_type.is_asymmetric() {
            warn!("{:?} record signed with {} while PKI is enforced", kind, signature_type);
            return Err(FirmwareError::AuthenticationFailed(format!(
                "{:?} record needs a SHA signature, found {}",
                kind, signature_type
            )));
        }
        Ok(())
    }

    /// Check the fixed header of `image`
    ///
    /// # Errors
    ///
    /// See [`check_header`].
    pub fn check_header(&self, image: &[u8]) -> Result<ImageHeader, ImageError> {
        check_header(image, self.soc_family)
    }

    /// Verify `signature` over the concatenation of `fragments`
    ///
    /// MD5 compares the checksum directly; SHA-256 and SHA-512 verify an
    /// Ed25519 signature over the digest with the installed firmware key.
    pub fn verify_fragments(
        &self,
        kind: SignatureType,
        fragments: &[&[u8]],
        signature: &[u8],
    ) -> FirmwareResult<()> {
        match kind {
            SignatureType::Null => self.accept_unsigned(),
            SignatureType::Md5 => Ok(verify_md5(fragments, signature)?),
            SignatureType::Sha256 | SignatureType::Sha512 => {
                kind.check_signature_len(signature.len())?;
                let key = self
                    .keys
                    .public_key(&self.key_name)?
                    .ok_or(CryptoError::KeyNotInstalled)?;
                let digest = digest_fragments(kind, fragments)?;
                DigestVerifier::verify(&digest, signature, &key).map_err(|e| {
                    FirmwareError::AuthenticationFailed(format!("{} ({})", e, key.fingerprint()))
                })
            }
        }
    }

    fn accept_unsigned(&self) -> FirmwareResult<()> {
        if self.allow_unsigned {
            warn!("Accepting unsigned image");
            Ok(())
        } else {
            Err(FirmwareError::UnsignedRejected)
        }
    }

    /// Verify the embedded signature of the stage-1 image
    ///
    /// The digest covers `[0, image_len)` with the value bytes of the
    /// signature record treated as zeros.
    ///
    /// # Errors
    ///
    /// Returns `UnsignedRejected` for an unsigned image when unsigned images
    /// are not allowed, `SignatureMissing` when a signed image has no
    /// signature record, and a crypto or authentication error when the
    /// signature does not verify.
    pub fn verify_signature(&self, image: &[u8], header: &ImageHeader) -> FirmwareResult<()> {
        let kind = SignatureType::from_raw(header.signature_type).ok_or_else(|| {
            CryptoError::UnsupportedAlgorithm(format!(
                "signature type {}",
                header.signature_type
            ))
        })?;
        if kind == SignatureType::Null {
            return self.accept_unsigned();
        }

        let stage1 = image
            .get(..header.image_len())
            .ok_or(ImageError::Truncated {
                declared: header.image_len(),
                actual: image.len(),
            })?;
        let view = find_tlv(stage1, header, TlvType::Signature)?
            .ok_or(FirmwareError::SignatureMissing)?;
        let signature = view.data(stage1);
        kind.check_signature_len(signature.len())?;

        let head = stage1.get(..view.data_offset).unwrap_or_default();
        let tail = stage1
            .get(view.data_offset.saturating_add(view.data_len)..)
            .unwrap_or_default();
        let zeros = vec![0u8; view.data_len];

        match self.verify_fragments(kind, &[head, &zeros, tail], signature) {
            Ok(()) => {
                info!("{} signature verified", kind);
                Ok(())
            }
            Err(e) => {
                warn!("{} signature rejected: {}", kind, e);
                Err(e)
            }
        }
    }

    /// Full acceptance check of a candidate image
    ///
    /// In order: header, board compatibility (when `board_machine` is known),
    /// signature, kernel presence, then every stage-2 record with its own
    /// signature.
    pub fn check_image(
        &self,
        image: &[u8],
        board_machine: Option<&str>,
    ) -> FirmwareResult<ImageInfo> {
        let header = self.check_header(image)?;

        if let Some(expected) = board_machine {
            let actual = header.machine_name();
            if actual != expected {
                return Err(ImageError::IncompatibleTarget {
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }

        self.verify_signature(image, &header)?;

        let stage1_len = header.image_len();
        let stage1 = image.get(..stage1_len).unwrap_or_default();
        let kernel = find_tlv(stage1, &header, TlvType::Kernel)?.ok_or(ImageError::NoKernel)?;

        let trailer = image.get(stage1_len..).unwrap_or_default();
        let stage2 = stage2_records(trailer, Some(self))?;
        if let Some(kind) = SignatureType::from_raw(header.signature_type)
            .filter(|kind| kind.is_asymmetric())
        {
            // A key-signed image never carries keyless payload records.
            let weak = stage2.iter().find(|record| {
                record.kind != Stage2Type::Filename && !record.signature_type.is_asymmetric()
            });
            if let Some(record) = weak {
                return Err(FirmwareError::AuthenticationFailed(format!(
                    "{} image carries a {} signed {:?} record",
                    kind, record.signature_type, record.kind
                )));
            }
        }
        debug!(
            "Image accepted: kernel {} bytes, {} stage-2 records",
            kernel.data_len,
            stage2.len()
        );

        Ok(ImageInfo {
            header,
            kernel,
            stage1_len,
            stage2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::{ImageBuilder, Stage2Record};
    use crate::image::stage2::{create_filename_tlv, encode_stage2_record};
    use switchfw_crypto::{KeyPair, StaticKeyProvider, md5_digest};

    fn config(allow_unsigned: bool) -> FirmwareConfig {
        FirmwareConfig {
            allow_unsigned,
            enforce_pki: false,
            system: crate::config::SystemIdentity {
                soc_family: 7,
                machine: None,
            },
            ..FirmwareConfig::default()
        }
    }

    #[test]
    fn test_unsigned_policy() -> Result<(), Box<dyn std::error::Error>> {
        let image = ImageBuilder::new("demo", 7)
            .kernel(vec![1u8; 64])
            .signature(SignatureType::Null)
            .build()?;
        let keys: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::new());

        let strict = ImageValidator::new(Arc::clone(&keys), &config(false));
        assert!(matches!(
            strict.check_image(&image, None),
            Err(FirmwareError::UnsignedRejected)
        ));

        let lenient = ImageValidator::new(keys, &config(true));
        lenient.check_image(&image, None)?;
        Ok(())
    }

    #[test]
    fn test_missing_key_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let keypair = KeyPair::generate()?;
        let image = ImageBuilder::new("demo", 7)
            .kernel(vec![1u8; 64])
            .signature(SignatureType::Sha256)
            .signing_key(keypair)
            .build()?;
        let validator = ImageValidator::new(Arc::new(StaticKeyProvider::new()), &config(false));
        assert!(matches!(
            validator.check_image(&image, None),
            Err(FirmwareError::Crypto(CryptoError::KeyNotInstalled))
        ));
        Ok(())
    }

    fn md5_record(kind: Stage2Type, data: &[u8]) -> FirmwareResult<Vec<u8>> {
        encode_stage2_record(kind, SignatureType::Md5, data, |signed| {
            Ok(md5_digest(signed).to_vec())
        })
    }

    #[test]
    fn test_md5_bootloader_cannot_ride_on_a_signed_image() -> Result<(), Box<dyn std::error::Error>>
    {
        let keypair = KeyPair::generate()?;
        let public = keypair.public_key.clone();
        let mut image = ImageBuilder::new("demo", 7)
            .kernel(vec![1u8; 64])
            .signature(SignatureType::Sha256)
            .signing_key(keypair)
            .build()?;
        let validator = ImageValidator::new(
            Arc::new(StaticKeyProvider::with_firmware_key(public)),
            &config(false),
        );
        validator.check_image(&image, None)?;

        // The device's own filename record is still accepted.
        image.extend(create_filename_tlv("fw.mfi").ok_or("no record")?);
        assert_eq!(validator.check_image(&image, None)?.stage2.len(), 1);

        image.extend(md5_record(Stage2Type::Bootloader, b"evil loader")?);
        assert!(matches!(
            validator.check_image(&image, None),
            Err(FirmwareError::AuthenticationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_enforced_pki_rejects_md5_payload_records() -> Result<(), Box<dyn std::error::Error>> {
        let image = ImageBuilder::new("demo", 7)
            .kernel(vec![1u8; 64])
            .stage2(Stage2Record::rootfs(vec![2u8; 32]))
            .build()?;
        let keys: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::new());

        let relaxed = ImageValidator::new(Arc::clone(&keys), &config(false));
        assert_eq!(relaxed.check_image(&image, None)?.stage2.len(), 1);

        let strict = ImageValidator::new(
            keys,
            &FirmwareConfig {
                enforce_pki: true,
                ..config(false)
            },
        );
        assert!(matches!(
            strict.check_image(&image, None),
            Err(FirmwareError::AuthenticationFailed(_))
        ));
        strict.check_stage2_scheme(Stage2Type::Filename, SignatureType::Md5)?;
        assert!(
            strict
                .check_stage2_scheme(Stage2Type::Bootloader, SignatureType::Md5)
                .is_err()
        );
        Ok(())
    }
}
