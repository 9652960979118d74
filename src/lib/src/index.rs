//! Index file format
//!
//! The index maps issuer hashes to byte ranges of the archive. It is a short
//! header followed by fixed-size records sorted ascending by issuer hash, so
//! any record can be reached with a single seek:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CAIX"
//! 4       2     format version (u16 LE, currently 1)
//! 6       2     reserved, zero
//! 8 + 40*i      record i:
//!         32    issuer hash (SHA-256 of the DER-encoded distinguished name)
//!         4     archive offset (u32 LE)
//!         4     certificate length (u32 LE)
//! ```
//!
//! Hashes compare as unsigned byte strings. When two records carry the same
//! hash, the one stored first wins.

use crate::error::CSError;
use sha2::{Digest, Sha256};
use std::fmt;

/// Index magic bytes
pub const INDEX_MAGIC: [u8; 4] = *b"CAIX";

/// Current index format version
pub const INDEX_FORMAT_VERSION: u16 = 1;

/// Size of the index header in bytes
pub const HEADER_SIZE: usize = 8;

/// Length of an issuer hash in bytes
pub const ISSUER_HASH_LEN: usize = 32;

/// Size of one index record in bytes
pub const RECORD_SIZE: usize = ISSUER_HASH_LEN + 4 + 4;

/// Byte offset of record `index` within the index file.
pub fn record_offset(index: u64) -> u64 {
    HEADER_SIZE as u64 + index * RECORD_SIZE as u64
}

/// SHA-256 of a DER-encoded distinguished name.
///
/// For a stored CA this is the hash of its subject; for a certificate
/// presented by a peer it is the hash of its issuer. The two match when the
/// CA signed the certificate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IssuerHash(pub [u8; ISSUER_HASH_LEN]);

impl IssuerHash {
    /// Hash a DER-encoded `Name`.
    pub fn from_name_der(name: &[u8]) -> Self {
        let digest = Sha256::digest(name);
        let mut out = [0u8; ISSUER_HASH_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Parse 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self, CSError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| CSError::InvalidArgument(format!("invalid issuer hash: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CSError> {
        let arr: [u8; ISSUER_HASH_LEN] = bytes.try_into().map_err(|_| {
            CSError::InvalidArgument(format!(
                "issuer hash must be {} bytes, got {}",
                ISSUER_HASH_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ISSUER_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IssuerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IssuerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IssuerHash({}..)", &self.to_hex()[..16])
    }
}

/// One index entry: where the certificate for an issuer lives in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub issuer_hash: IssuerHash,
    pub archive_offset: u32,
    pub length: u32,
}

impl IndexRecord {
    pub fn new(issuer_hash: IssuerHash, archive_offset: u32, length: u32) -> Self {
        Self {
            issuer_hash,
            archive_offset,
            length,
        }
    }

    /// End of the certificate's byte range in the archive.
    pub fn archive_end(&self) -> u64 {
        self.archive_offset as u64 + self.length as u64
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..ISSUER_HASH_LEN].copy_from_slice(&self.issuer_hash.0);
        out[ISSUER_HASH_LEN..ISSUER_HASH_LEN + 4].copy_from_slice(&self.archive_offset.to_le_bytes());
        out[ISSUER_HASH_LEN + 4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Decode a record. Fails if fewer than [`RECORD_SIZE`] bytes are given.
    pub fn decode(bytes: &[u8]) -> Result<Self, CSError> {
        if bytes.len() < RECORD_SIZE {
            return Err(CSError::ShortRead {
                expected: RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let mut hash = [0u8; ISSUER_HASH_LEN];
        hash.copy_from_slice(&bytes[..ISSUER_HASH_LEN]);
        let mut offset = [0u8; 4];
        offset.copy_from_slice(&bytes[ISSUER_HASH_LEN..ISSUER_HASH_LEN + 4]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[ISSUER_HASH_LEN + 4..RECORD_SIZE]);
        Ok(Self {
            issuer_hash: IssuerHash(hash),
            archive_offset: u32::from_le_bytes(offset),
            length: u32::from_le_bytes(length),
        })
    }
}

/// The fixed index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u16,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
        }
    }
}

impl IndexHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&INDEX_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Decode and validate a header.
    pub fn decode(bytes: &[u8]) -> Result<Self, CSError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CSError::InitFailure(format!(
                "index header truncated ({} of {} bytes)",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        if bytes[..4] != INDEX_MAGIC {
            return Err(CSError::InitFailure(format!(
                "bad index magic {}",
                hex::encode(&bytes[..4])
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != INDEX_FORMAT_VERSION {
            return Err(CSError::InitFailure(format!(
                "unsupported index version {} (expected {})",
                version, INDEX_FORMAT_VERSION
            )));
        }
        if bytes[6..8] != [0, 0] {
            return Err(CSError::InitFailure(
                "reserved index header bytes are not zero".to_string(),
            ));
        }
        Ok(Self { version })
    }
}

/// Number of records in an index of `index_len` bytes.
///
/// Fails when the file cannot hold a header or when the body is not a whole
/// number of records.
pub fn record_count(index_len: u64) -> Result<u64, CSError> {
    if index_len < HEADER_SIZE as u64 {
        return Err(CSError::InitFailure(format!(
            "index is {} bytes, smaller than its header",
            index_len
        )));
    }
    let body = index_len - HEADER_SIZE as u64;
    if body % RECORD_SIZE as u64 != 0 {
        return Err(CSError::InitFailure(format!(
            "index body of {} bytes is not a multiple of the {}-byte record size",
            body, RECORD_SIZE
        )));
    }
    Ok(body / RECORD_SIZE as u64)
}
