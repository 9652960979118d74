//! Fuzz target for trust anchor extraction
//!
//! Stored certificates come from flash that may be corrupted, so the
//! extractor must reject any input without panicking or over-reading.

#![no_main]

use castore::anchor::{certificate_names, describe_name};
use castore::extract_trust_anchor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(names) = certificate_names(data) {
        let _ = names.is_self_issued();
        let _ = describe_name(names.issuer);
        let _ = describe_name(names.subject);
    }

    if let Ok(anchor) = extract_trust_anchor(data) {
        let _ = anchor.subject_hash();
        let _ = anchor.public_key.algorithm();
        let pki = anchor.to_pki_types();
        assert!(pki.subject.as_ref().len() < anchor.subject.len());
    }
});
