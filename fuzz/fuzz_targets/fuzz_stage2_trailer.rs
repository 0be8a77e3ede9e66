//! Fuzzes the stage-2 trailer walk.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_stage2_trailer

#![deny(static_mut_refs)]
#![no_main]

use libfuzzer_sys::fuzz_target;
use switchfw_update::image::{Stage2Walker, last_bootloader};

fuzz_target!(|data: &[u8]| {
    let records: Vec<_> = Stage2Walker::new(data, None).flatten().collect();
    for record in &records {
        assert!(record.end() <= data.len());
        let _ = record.data(data);
        let _ = record.signature(data);
    }
    let _ = last_bootloader(&records);
});
