//! Fuzz target for lookups against arbitrary index and archive contents
//!
//! The first 32 bytes are the hash to look up, the next two bytes split the
//! rest into index and archive.

#![no_main]

use castore::{CertStore, IssuerHash, MemoryStream, StoreConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 34 {
        return;
    }
    let Ok(hash) = IssuerHash::from_slice(&data[..32]) else {
        return;
    };
    let split = u16::from_le_bytes([data[32], data[33]]) as usize;
    let rest = &data[34..];
    let split = split.min(rest.len());

    let mut store = CertStore::new(
        MemoryStream::new("index", rest[..split].to_vec()),
        MemoryStream::new("archive", rest[split..].to_vec()),
        StoreConfig::default().with_yield_between_probes(false),
    );
    if store.initialize() == 0 {
        return;
    }
    if let Ok(Some(anchor)) = store.find_trust_anchor_by_issuer_hash(&hash) {
        assert_eq!(anchor.subject_hash(), hash);
    }
});
