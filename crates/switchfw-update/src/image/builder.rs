//! Image assembly and signing

use switchfw_crypto::{DigestSigner, KeyPair, SignatureType, digest_fragments, md5_digest};
use tracing::debug;

use super::stage2::{Stage2Type, create_filename_tlv, encode_stage2_record};
use super::{IMAGE_HEADER_SIZE, ImageHeader, TlvType};
use crate::error::{FirmwareError, FirmwareResult};
use crate::tlv::{TLV_HEADER_SIZE, encode_tlv};

/// Payload of one stage-2 record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage2Record {
    /// Record type
    pub kind: Stage2Type,
    /// Record payload
    pub data: Vec<u8>,
}

impl Stage2Record {
    /// Bootloader record
    pub fn bootloader(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: Stage2Type::Bootloader,
            data: data.into(),
        }
    }

    /// Secondary root filesystem record
    pub fn rootfs(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: Stage2Type::Rootfs,
            data: data.into(),
        }
    }
}

/// Builder for signed firmware images
#[derive(Debug)]
pub struct ImageBuilder {
    machine: String,
    soc_name: String,
    soc_id: u32,
    kernel: Option<Vec<u8>>,
    tlvs: Vec<(TlvType, Vec<u8>)>,
    signature_type: SignatureType,
    keypair: Option<KeyPair>,
    stage2: Vec<Stage2Record>,
    stage2_filename: Option<String>,
}

fn sign_bytes(
    kind: SignatureType,
    keypair: Option<&KeyPair>,
    fragments: &[&[u8]],
) -> FirmwareResult<Vec<u8>> {
    match kind {
        SignatureType::Null => Ok(Vec::new()),
        SignatureType::Md5 => {
            let digest = digest_fragments(kind, fragments)?;
            Ok(digest.as_bytes().to_vec())
        }
        SignatureType::Sha256 | SignatureType::Sha512 => {
            let keypair = keypair
                .ok_or_else(|| FirmwareError::config(format!("{} signing needs a key", kind)))?;
            let digest = digest_fragments(kind, fragments)?;
            Ok(DigestSigner::sign(&digest, keypair).as_bytes().to_vec())
        }
    }
}

impl ImageBuilder {
    /// Start an image for `machine` on chip family `soc_id`, MD5-signed by
    /// default
    pub fn new(machine: impl Into<String>, soc_id: u32) -> Self {
        Self {
            machine: machine.into(),
            soc_name: String::new(),
            soc_id,
            kernel: None,
            tlvs: Vec::new(),
            signature_type: SignatureType::Md5,
            keypair: None,
            stage2: Vec::new(),
            stage2_filename: None,
        }
    }

    /// Set the SoC name
    #[must_use]
    pub fn soc_name(mut self, name: impl Into<String>) -> Self {
        self.soc_name = name.into();
        self
    }

    /// Set the kernel payload
    #[must_use]
    pub fn kernel(mut self, kernel: impl Into<Vec<u8>>) -> Self {
        self.kernel = Some(kernel.into());
        self
    }

    /// Append another stage-1 record
    #[must_use]
    pub fn tlv(mut self, kind: TlvType, data: impl Into<Vec<u8>>) -> Self {
        self.tlvs.push((kind, data.into()));
        self
    }

    /// Set the signature scheme
    #[must_use]
    pub fn signature(mut self, kind: SignatureType) -> Self {
        self.signature_type = kind;
        self
    }

    /// Set the key used for SHA-256/SHA-512 signatures
    #[must_use]
    pub fn signing_key(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Append a stage-2 record
    #[must_use]
    pub fn stage2(mut self, record: Stage2Record) -> Self {
        self.stage2.push(record);
        self
    }

    /// Append a stage-2 filename record
    #[must_use]
    pub fn stage2_filename(mut self, name: impl Into<String>) -> Self {
        self.stage2_filename = Some(name.into());
        self
    }

    /// Assemble and sign the image
    ///
    /// # Errors
    ///
    /// Fails when a SHA signature is requested without a signing key, or
    /// when the image outgrows the 32-bit length fields.
    pub fn build(self) -> FirmwareResult<Vec<u8>> {
        let kind = self.signature_type;
        let mut header = ImageHeader::new(&self.machine, &self.soc_name, self.soc_id, kind.as_raw());

        let mut body = Vec::new();
        if let Some(kernel) = &self.kernel {
            body.extend(encode_tlv(TlvType::Kernel.as_raw(), kernel));
        }
        for (tlv_kind, data) in &self.tlvs {
            body.extend(encode_tlv(tlv_kind.as_raw(), data));
        }
        let signature_offset = match kind.signature_len() {
            Some(len) if len > 0 => {
                let offset = IMAGE_HEADER_SIZE
                    .saturating_add(body.len())
                    .saturating_add(TLV_HEADER_SIZE);
                body.extend(encode_tlv(TlvType::Signature.as_raw(), &vec![0u8; len]));
                Some((offset, len))
            }
            _ => None,
        };

        let image_len = IMAGE_HEADER_SIZE.saturating_add(body.len());
        header.image_len = u32::try_from(image_len)
            .map_err(|e| FirmwareError::config(format!("image too large: {}", e)))?;
        let mut image = header.encode().to_vec();
        image.extend(body);

        if let Some((offset, len)) = signature_offset {
            let signature = sign_bytes(kind, self.keypair.as_ref(), &[image.as_slice()])?;
            let slot = image
                .get_mut(offset..offset.saturating_add(len))
                .ok_or_else(|| FirmwareError::config("signature slot outside image"))?;
            slot.copy_from_slice(&signature);
        }

        for record in &self.stage2 {
            let keypair = self.keypair.as_ref();
            image.extend(encode_stage2_record(record.kind, kind, &record.data, |signed| {
                sign_bytes(kind, keypair, &[signed])
            })?);
        }
        if let Some(record) = self.stage2_filename.as_deref().and_then(create_filename_tlv) {
            image.extend(record);
        }

        debug!(
            "Built {} image for '{}': {} bytes, stage-1 {} bytes",
            kind,
            self.machine,
            image.len(),
            image_len
        );
        Ok(image)
    }
}

/// MD5 of a finished image, handy for reporting
pub fn image_md5_hex(image: &[u8]) -> String {
    hex::encode(md5_digest(image))
}
