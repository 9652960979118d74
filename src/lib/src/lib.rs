//! An indexed CA certificate store for devices that cannot hold a trust bundle in RAM.
//!
//! Hundreds of CA certificates live in two files on flash: an archive of raw
//! DER certificates and a sorted index of `(issuer hash, offset, length)`
//! records. A TLS handshake asks the store for the CA that issued the peer's
//! certificate; the store binary-searches the index on storage, reads that
//! one certificate into a fixed scratch buffer and returns its trust anchor.

#![forbid(unsafe_code)]

mod error;

/// Index file format and codec
pub mod index;

/// Storage backends
pub mod stream;

/// Reading certificates out of the archive
pub mod archive;

/// Trust anchor extraction
pub mod anchor;

/// The certificate store
pub mod store;

/// Building index and archive files
pub mod builder;

/// rustls server certificate verification against the store
pub mod handshake;

pub use anchor::{extract_trust_anchor, issuer_hash_of, subject_hash_of, NamedCurve, PublicKey, TrustAnchor};
pub use builder::{read_certificates, BuildSummary, IndexBuilder};
pub use error::*;
pub use handshake::{client_config, IndexedCertVerifier, SharedCertStore};
pub use index::{IndexRecord, IssuerHash};
pub use store::{CertStore, LookupStats, StoreConfig, StoreState};
pub use stream::{
    BlockDevice, BlockStream, ByteStream, FileStream, MemoryBlockDevice, MemoryStream, OpenMode,
};

pub mod reexports {
    pub use {log, rustls, rustls_pki_types, thiserror, webpki, x509_parser};
}
