//! Fuzzes partition table parsing and re-encoding.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_fis_table

#![deny(static_mut_refs)]
#![no_main]

use libfuzzer_sys::fuzz_target;
use switchfw_update::FisTable;
use switchfw_update::fis::FIS_ENTRY_SIZE;

fuzz_target!(|data: &[u8]| {
    let table = FisTable::parse(data);
    let _ = table.validity();
    for entry in table.entries() {
        let _ = entry.name();
    }
    assert!(table.slot_count() <= data.len() / FIS_ENTRY_SIZE);
    assert_eq!(table.encode().len(), table.slot_count() * FIS_ENTRY_SIZE);
});
