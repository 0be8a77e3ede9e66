//! Fuzzes installed key parsing.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_public_key

#![deny(static_mut_refs)]
#![no_main]

use libfuzzer_sys::fuzz_target;
use switchfw_crypto::parse_public_key;

fuzz_target!(|data: &[u8]| {
    // Must never panic on arbitrary bytes.
    let _ = parse_public_key(data, "fwkey");
});
