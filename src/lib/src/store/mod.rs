//! The certificate store
//!
//! [`CertStore`] owns the index and archive streams for its whole lifetime
//! and answers "which trust anchor issued this?" without ever holding more
//! than one certificate in memory.
//!
//! A lookup is a lower-bound binary search run directly against the index
//! stream: each probe seeks to one record, reads its 40 bytes and compares
//! hashes. The last record that compared greater than or equal to the target
//! is remembered, so the final equality check needs no extra read. A search
//! over `N` records costs at most `ceil(log2(N + 1))` probes, and when several
//! records share a hash the one stored first is returned.
//!
//! On a match the certificate's bytes are read into the store's single
//! scratch buffer and turned into an owned [`TrustAnchor`].
//!
//! # Example
//!
//! ```rust,ignore
//! use castore::{CertStore, FileStream, StoreConfig};
//!
//! let mut store = CertStore::new(
//!     FileStream::new("/flash/ca.idx"),
//!     FileStream::new("/flash/ca.bin"),
//!     StoreConfig::embedded(),
//! );
//! if store.initialize() == 0 {
//!     // No usable trust store: every handshake will fail closed.
//! }
//! let anchor = store.find_trust_anchor_by_issuer_hash(&issuer_hash)?;
//! ```

mod config;

pub use config::{StoreConfig, DEFAULT_MAX_CERTIFICATE_SIZE};

use crate::anchor::{extract_trust_anchor, TrustAnchor};
use crate::archive::{read_exact_at, ArchiveReader};
use crate::error::CSError;
use crate::index::{self, IndexHeader, IndexRecord, IssuerHash, HEADER_SIZE, RECORD_SIZE};
use crate::stream::{ByteStream, FileStream, OpenMode};
use std::path::Path;

/// Lifecycle of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// `initialize` has not run yet
    Uninitialized,
    /// Streams are open and the index header checked out
    Ready { record_count: u64 },
    /// Initialization failed; every lookup reports [`CSError::NotReady`]
    Unusable,
}

/// I/O spent by the most recent lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Index records read during the search
    pub index_probes: u32,
    /// Certificate bytes read from the archive
    pub archive_bytes_read: u64,
    /// Times the search yielded the CPU between probes
    pub yields: u32,
}

/// An on-storage set of CA certificates, searchable by issuer hash.
pub struct CertStore<I: ByteStream, A: ByteStream> {
    index: I,
    archive: A,
    config: StoreConfig,
    scratch: Vec<u8>,
    state: StoreState,
    archive_len: u64,
    last_stats: LookupStats,
}

impl CertStore<FileStream, FileStream> {
    /// Store backed by two files on a regular filesystem.
    pub fn open_files(
        index_path: impl AsRef<Path>,
        archive_path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Self {
        Self::new(
            FileStream::new(index_path.as_ref()),
            FileStream::new(archive_path.as_ref()),
            config,
        )
    }
}

impl<I: ByteStream, A: ByteStream> CertStore<I, A> {
    /// Create a store. No I/O happens until [`Self::initialize`].
    pub fn new(index: I, archive: A, config: StoreConfig) -> Self {
        let scratch = vec![0u8; config.max_certificate_size];
        Self {
            index,
            archive,
            config,
            scratch,
            state: StoreState::Uninitialized,
            archive_len: 0,
            last_stats: LookupStats::default(),
        }
    }

    /// Open and validate the store.
    ///
    /// Returns the number of usable records, or 0 when the store cannot be
    /// used. The cause of a failure is logged; use [`Self::try_initialize`]
    /// to get it as an error.
    pub fn initialize(&mut self) -> usize {
        match self.try_initialize() {
            Ok(count) => count,
            Err(e) => {
                log::error!("Certificate store unusable: {}", e);
                0
            }
        }
    }

    /// Open and validate the store, reporting why it is unusable.
    ///
    /// Running it again reopens both streams.
    pub fn try_initialize(&mut self) -> Result<usize, CSError> {
        self.index.close();
        self.archive.close();
        self.state = StoreState::Unusable;

        match self.open_and_validate() {
            Ok(record_count) => {
                self.state = StoreState::Ready { record_count };
                log::info!(
                    "Certificate store ready: {} records in '{}', {} archive bytes in '{}'",
                    record_count,
                    self.index.name(),
                    self.archive_len,
                    self.archive.name()
                );
                usize::try_from(record_count).map_err(|_| {
                    CSError::InitFailure(format!("{} records do not fit in memory indices", record_count))
                })
            }
            Err(e) => {
                self.index.close();
                self.archive.close();
                Err(match e {
                    CSError::InitFailure(_) => e,
                    other => CSError::InitFailure(other.to_string()),
                })
            }
        }
    }

    fn open_and_validate(&mut self) -> Result<u64, CSError> {
        self.index.open(OpenMode::Read).map_err(|e| {
            CSError::InitFailure(format!("cannot open index '{}': {}", self.index.name(), e))
        })?;
        self.archive.open(OpenMode::Read).map_err(|e| {
            CSError::InitFailure(format!(
                "cannot open archive '{}': {}",
                self.archive.name(),
                e
            ))
        })?;

        let index_len = self.index.len()?;
        let record_count = index::record_count(index_len)?;

        let mut header = [0u8; HEADER_SIZE];
        read_exact_at(&mut self.index, 0, &mut header, self.config.read_retries)?;
        let header = IndexHeader::decode(&header)?;
        log::debug!(
            "Index '{}' format v{}, {} bytes",
            self.index.name(),
            header.version,
            index_len
        );

        self.archive_len = self.archive.len()?;

        if self.config.verify_order {
            self.verify_index(record_count)?;
        }
        Ok(record_count)
    }

    /// One pass over every record: ascending hashes, ranges inside the archive.
    fn verify_index(&mut self, record_count: u64) -> Result<(), CSError> {
        let mut previous: Option<IssuerHash> = None;
        for position in 0..record_count {
            let record = self.read_record(position)?;
            if previous.is_some_and(|p| p > record.issuer_hash) {
                return Err(CSError::InitFailure(format!(
                    "index is not sorted at record {}",
                    position
                )));
            }
            if record.archive_end() > self.archive_len {
                return Err(CSError::InitFailure(format!(
                    "record {} points past the end of the archive",
                    position
                )));
            }
            previous = Some(record.issuer_hash);
        }
        log::debug!("Verified ordering of {} index records", record_count);
        Ok(())
    }

    fn read_record(&mut self, position: u64) -> Result<IndexRecord, CSError> {
        let mut buf = [0u8; RECORD_SIZE];
        read_exact_at(
            &mut self.index,
            index::record_offset(position),
            &mut buf,
            self.config.read_retries,
        )?;
        IndexRecord::decode(&buf)
    }

    /// Current lifecycle state
    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, StoreState::Ready { .. })
    }

    /// Number of records, 0 unless the store is ready.
    pub fn record_count(&self) -> u64 {
        match self.state {
            StoreState::Ready { record_count } => record_count,
            _ => 0,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Size of the scratch buffer. Fixed at construction.
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.len()
    }

    /// I/O cost of the most recent lookup
    pub fn last_lookup_stats(&self) -> LookupStats {
        self.last_stats
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Release both streams. The store must be initialized again before use.
    pub fn close(&mut self) {
        self.index.close();
        self.archive.close();
        self.state = StoreState::Uninitialized;
    }

    fn ready_count(&self) -> Result<u64, CSError> {
        match self.state {
            StoreState::Ready { record_count } => Ok(record_count),
            _ => Err(CSError::NotReady),
        }
    }

    /// Read the record at `position` in index order.
    pub fn record_at(&mut self, position: u64) -> Result<IndexRecord, CSError> {
        let record_count = self.ready_count()?;
        if position >= record_count {
            return Err(CSError::InvalidArgument(format!(
                "record {} out of range (store has {})",
                position, record_count
            )));
        }
        self.read_record(position)
    }

    /// Find the first record carrying `issuer_hash`, reading only the index.
    pub fn find_record(&mut self, issuer_hash: &IssuerHash) -> Result<Option<IndexRecord>, CSError> {
        let record_count = self.ready_count()?;
        self.last_stats = LookupStats::default();

        let mut low = 0u64;
        let mut high = record_count;
        let mut candidate: Option<IndexRecord> = None;

        while low < high {
            if self.config.yield_between_probes && self.last_stats.index_probes > 0 {
                std::thread::yield_now();
                self.last_stats.yields += 1;
            }
            let mid = low + (high - low) / 2;
            let record = self.read_record(mid)?;
            self.last_stats.index_probes += 1;
            log::trace!("probe {}: {}", mid, record.issuer_hash);

            if record.issuer_hash < *issuer_hash {
                low = mid + 1;
            } else {
                candidate = Some(record);
                high = mid;
            }
        }

        Ok(candidate.filter(|record| record.issuer_hash == *issuer_hash))
    }

    /// Read the certificate `record` points at and build its trust anchor.
    pub fn trust_anchor_for(&mut self, record: &IndexRecord) -> Result<TrustAnchor, CSError> {
        self.ready_count()?;
        let mut reader =
            ArchiveReader::new(&mut self.archive, self.archive_len, self.config.read_retries);
        let der = reader.read_certificate(record, &mut self.scratch)?;
        self.last_stats.archive_bytes_read += der.len() as u64;
        extract_trust_anchor(der)
    }

    /// Look up the trust anchor whose subject hashes to `issuer_hash`.
    ///
    /// `Ok(None)` means no stored CA has that name. Errors mean the lookup
    /// could not be completed and the caller must not trust the chain.
    pub fn find_trust_anchor_by_issuer_hash(
        &mut self,
        issuer_hash: &IssuerHash,
    ) -> Result<Option<TrustAnchor>, CSError> {
        let record = match self.find_record(issuer_hash)? {
            Some(record) => record,
            None => {
                log::debug!(
                    "No trust anchor for {} after {} probes",
                    issuer_hash,
                    self.last_stats.index_probes
                );
                return Ok(None);
            }
        };

        let anchor = self.trust_anchor_for(&record).map_err(|e| {
            log::warn!(
                "Stored certificate for {} at archive offset {} is unusable: {}",
                issuer_hash,
                record.archive_offset,
                e
            );
            e
        })?;

        if anchor.subject_hash() != *issuer_hash {
            return Err(CSError::Corrupt(format!(
                "record for {} holds a certificate for {}",
                issuer_hash,
                anchor.subject_hash()
            )));
        }

        log::debug!(
            "Found trust anchor {} for {} ({} probes, {} bytes)",
            anchor.subject_display(),
            issuer_hash,
            self.last_stats.index_probes,
            self.last_stats.archive_bytes_read
        );
        Ok(Some(anchor))
    }
}
