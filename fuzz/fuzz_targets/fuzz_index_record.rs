//! Fuzz target for the index header and record codec

#![no_main]

use castore::index::{IndexHeader, IndexRecord, RECORD_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = IndexHeader::decode(data);

    match IndexRecord::decode(data) {
        Ok(record) => {
            assert!(data.len() >= RECORD_SIZE);
            assert_eq!(&record.encode()[..], &data[..RECORD_SIZE]);
        }
        Err(_) => assert!(data.len() < RECORD_SIZE),
    }
});
