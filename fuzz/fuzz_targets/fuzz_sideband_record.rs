//! Fuzzes the sideband metadata decoder.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_sideband_record

#![deny(static_mut_refs)]
#![no_main]

use libfuzzer_sys::fuzz_target;
use switchfw_update::SidebandRecord;

fuzz_target!(|data: &[u8]| {
    if let Some(record) = SidebandRecord::decode(data) {
        let _ = record.filename();
        let _ = record.stage2_filename();
    }
});
