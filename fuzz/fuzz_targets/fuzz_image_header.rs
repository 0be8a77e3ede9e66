//! Fuzzes the image header check and the stage-1 record scan.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_image_header

#![deny(static_mut_refs)]
#![no_main]

use libfuzzer_sys::fuzz_target;
use switchfw_update::image::{check_header, find_tlv};
use switchfw_update::TlvType;

fuzz_target!(|data: &[u8]| {
    // Must never panic on arbitrary bytes.
    let soc_family = data
        .get(84..88)
        .and_then(|b| b.try_into().ok())
        .map_or(0, u32::from_le_bytes);
    if let Ok(header) = check_header(data, soc_family) {
        for record in header.tlvs(data) {
            if record.is_err() {
                break;
            }
        }
        let _ = find_tlv(data, &header, TlvType::Kernel);
    }
});
