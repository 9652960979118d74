//! Offline construction of index and archive files
//!
//! Certificates are collected from DER files or PEM bundles, keyed by the
//! hash of their subject name, sorted and written out. A certificate that
//! the store would not be able to turn into a trust anchor is refused here
//! rather than discovered during a handshake.

use crate::anchor::{extract_trust_anchor, TrustAnchor};
use crate::error::CSError;
use crate::index::{IndexHeader, IndexRecord, IssuerHash, HEADER_SIZE, RECORD_SIZE};
use crate::stream::{ByteStream, OpenMode, DEFAULT_WRITE_RETRIES};

const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

struct Entry {
    hash: IssuerHash,
    subject: String,
    der: Vec<u8>,
}

/// Outcome of [`IndexBuilder::write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Certificates written
    pub certificates: usize,
    /// Distinct certificates sharing a subject with an earlier one
    pub shared_subjects: usize,
    pub index_bytes: u64,
    pub archive_bytes: u64,
}

/// Collects CA certificates and writes a sorted index plus archive.
#[derive(Default)]
pub struct IndexBuilder {
    entries: Vec<Entry>,
    max_certificate_size: Option<usize>,
    write_retries: Option<u32>,
    skipped: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse certificates the store's scratch buffer could not hold.
    pub fn with_max_certificate_size(mut self, size: usize) -> Self {
        self.max_certificate_size = Some(size);
        self
    }

    /// Retry a busy stream up to `retries` times in a row while writing.
    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = Some(retries);
        self
    }

    /// Number of certificates accepted so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of bundle entries refused so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Add one DER-encoded CA certificate.
    ///
    /// Returns the subject hash it will be stored under. Adding the exact
    /// same certificate twice is a no-op.
    pub fn add_der(&mut self, der: Vec<u8>) -> Result<IssuerHash, CSError> {
        if let Some(max) = self.max_certificate_size {
            if der.len() > max {
                return Err(CSError::CertificateTooLarge {
                    length: der.len(),
                    max,
                });
            }
        }
        if u32::try_from(der.len()).is_err() {
            return Err(CSError::CertificateTooLarge {
                length: der.len(),
                max: u32::MAX as usize,
            });
        }

        let anchor: TrustAnchor = extract_trust_anchor(&der)?;
        let hash = anchor.subject_hash();
        if self.entries.iter().any(|e| e.hash == hash && e.der == der) {
            log::debug!("Skipping repeated certificate for {}", anchor.subject_display());
            return Ok(hash);
        }
        log::debug!(
            "Adding {} ({}, {} bytes) as {}",
            anchor.subject_display(),
            anchor.public_key.algorithm(),
            der.len(),
            hash
        );
        self.entries.push(Entry {
            hash,
            subject: anchor.subject_display(),
            der,
        });
        Ok(hash)
    }

    /// Add every certificate of a PEM bundle.
    ///
    /// Non-certificate PEM blocks are ignored. Certificates that cannot be
    /// used as trust anchors are logged and skipped. Returns how many were
    /// accepted.
    pub fn add_pem_bundle(&mut self, pem_data: &[u8]) -> Result<usize, CSError> {
        let mut added = 0;
        for der in parse_pem_certificates(pem_data)? {
            match self.add_der(der) {
                Ok(_) => added += 1,
                Err(e) => {
                    log::warn!("Skipping certificate: {}", e);
                    self.skipped += 1;
                }
            }
        }
        Ok(added)
    }

    /// Add a single DER certificate or a PEM bundle, whichever `data` holds.
    pub fn add_bundle(&mut self, data: &[u8]) -> Result<usize, CSError> {
        if is_der(data) {
            self.add_der(data.to_vec())?;
            Ok(1)
        } else {
            self.add_pem_bundle(data)
        }
    }

    /// Write the archive and the index.
    ///
    /// Records are sorted by issuer hash. Certificates that share a subject
    /// keep the order they were added in, so the first one added is the one
    /// lookups return. On failure both streams are closed and their content
    /// must be discarded.
    pub fn write<I, A>(&mut self, index: &mut I, archive: &mut A) -> Result<BuildSummary, CSError>
    where
        I: ByteStream + ?Sized,
        A: ByteStream + ?Sized,
    {
        self.entries.sort_by(|a, b| a.hash.cmp(&b.hash));

        let summary = self
            .write_archive(archive)
            .and_then(|(records, summary)| {
                self.write_index(index, &records)?;
                Ok(summary)
            })
            .map_err(|e| {
                log::error!(
                    "Failed to write index '{}' and archive '{}': {}",
                    index.name(),
                    archive.name(),
                    e
                );
                archive.close();
                index.close();
                e
            })?;

        log::info!(
            "Wrote {} certificates: index '{}' ({} bytes), archive '{}' ({} bytes)",
            summary.certificates,
            index.name(),
            summary.index_bytes,
            archive.name(),
            summary.archive_bytes
        );
        Ok(summary)
    }

    fn write_archive<A: ByteStream + ?Sized>(
        &self,
        archive: &mut A,
    ) -> Result<(Vec<IndexRecord>, BuildSummary), CSError> {
        let retries = self.write_retries.unwrap_or(DEFAULT_WRITE_RETRIES);
        let mut summary = BuildSummary::default();
        let mut records = Vec::with_capacity(self.entries.len());
        let mut offset: u64 = 0;

        archive.open(OpenMode::Write)?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 && self.entries[i - 1].hash == entry.hash {
                log::warn!(
                    "Several certificates share the subject {}; lookups return the first",
                    entry.subject
                );
                summary.shared_subjects += 1;
            }
            let archive_offset = u32::try_from(offset).map_err(|_| {
                CSError::InvalidArgument("archive exceeds 4 GiB".to_string())
            })?;
            archive.write_all_with_retries(&entry.der, retries)?;
            records.push(IndexRecord::new(
                entry.hash,
                archive_offset,
                entry.der.len() as u32,
            ));
            offset += entry.der.len() as u64;
        }
        archive.flush()?;
        archive.close();

        summary.certificates = records.len();
        summary.archive_bytes = offset;
        summary.index_bytes = (HEADER_SIZE + records.len() * RECORD_SIZE) as u64;
        Ok((records, summary))
    }

    fn write_index<I: ByteStream + ?Sized>(
        &self,
        index: &mut I,
        records: &[IndexRecord],
    ) -> Result<(), CSError> {
        let retries = self.write_retries.unwrap_or(DEFAULT_WRITE_RETRIES);
        index.open(OpenMode::Write)?;
        index.write_all_with_retries(&IndexHeader::default().encode(), retries)?;
        for record in records {
            index.write_all_with_retries(&record.encode(), retries)?;
        }
        index.flush()?;
        index.close();
        Ok(())
    }
}

fn is_der(data: &[u8]) -> bool {
    data.first() == Some(&0x30)
}

fn parse_pem_certificates(pem_data: &[u8]) -> Result<Vec<Vec<u8>>, CSError> {
    let blocks = pem::parse_many(pem_data)
        .map_err(|e| CSError::ParseError(format!("invalid PEM bundle: {}", e)))?;
    Ok(blocks
        .into_iter()
        .filter(|block| {
            let keep = block.tag() == PEM_CERTIFICATE_TAG;
            if !keep {
                log::debug!("Ignoring PEM block '{}'", block.tag());
            }
            keep
        })
        .map(|block| block.into_contents())
        .collect())
}

/// Split a file holding one DER certificate or any number of PEM
/// certificates into DER blobs, in file order.
pub fn read_certificates(data: &[u8]) -> Result<Vec<Vec<u8>>, CSError> {
    if is_der(data) {
        Ok(vec![data.to_vec()])
    } else {
        parse_pem_certificates(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::tests::{certificate, name, rsa_spki};
    use crate::stream::MemoryStream;

    fn ca(common_name: &str, modulus_byte: u8) -> Vec<u8> {
        let subject = name(common_name);
        let spki = rsa_spki(&[modulus_byte; 128], &[0x01, 0x00, 0x01]);
        certificate(&subject, &subject, &spki)
    }

    #[test]
    fn test_write_sorted_index() {
        let mut builder = IndexBuilder::new();
        for cn in ["Alpha", "Bravo", "Charlie", "Delta"] {
            builder.add_der(ca(cn, 0xC1)).unwrap();
        }

        let mut index = MemoryStream::empty("index");
        let mut archive = MemoryStream::empty("archive");
        let summary = builder.write(&mut index, &mut archive).unwrap();
        assert_eq!(summary.certificates, 4);
        assert_eq!(summary.index_bytes as usize, index.data().len());
        assert_eq!(summary.archive_bytes as usize, archive.data().len());

        let data = index.data();
        IndexHeader::decode(&data[..HEADER_SIZE]).unwrap();
        let records: Vec<IndexRecord> = data[HEADER_SIZE..]
            .chunks(RECORD_SIZE)
            .map(|c| IndexRecord::decode(c).unwrap())
            .collect();
        assert!(records.windows(2).all(|w| w[0].issuer_hash <= w[1].issuer_hash));

        for record in &records {
            let der = &archive.data()[record.archive_offset as usize..record.archive_end() as usize];
            let anchor = extract_trust_anchor(der).unwrap();
            assert_eq!(anchor.subject_hash(), record.issuer_hash);
        }
    }

    #[test]
    fn test_failed_write_closes_both_streams() {
        let mut builder = IndexBuilder::new();
        for cn in ["Alpha", "Bravo", "Charlie"] {
            builder.add_der(ca(cn, 0xC1)).unwrap();
        }

        let mut index = MemoryStream::empty("index");
        let mut archive = MemoryStream::empty("archive").with_failing_writes_after(1);
        let err = builder.write(&mut index, &mut archive).unwrap_err();
        assert!(err.is_io_failure());
        assert!(!archive.is_open());
        assert!(!index.is_open());
        assert_eq!(index.write_calls(), 0);

        let mut index = MemoryStream::empty("index").with_failing_writes_after(2);
        let mut archive = MemoryStream::empty("archive");
        assert!(builder.write(&mut index, &mut archive).is_err());
        assert!(!archive.is_open());
        assert!(!index.is_open());
    }

    #[test]
    fn test_busy_stream_fails_the_build() {
        let mut builder = IndexBuilder::new().with_write_retries(2);
        builder.add_der(ca("Alpha", 0xC1)).unwrap();

        let mut index = MemoryStream::empty("index");
        let mut archive = MemoryStream::empty("archive").with_busy_writes();
        assert!(matches!(
            builder.write(&mut index, &mut archive),
            Err(CSError::WouldBlock)
        ));
        assert_eq!(archive.write_calls(), 3);
        assert!(!archive.is_open());
    }

    #[test]
    fn test_repeated_certificate_is_ignored() {
        let mut builder = IndexBuilder::new();
        let cert = ca("Alpha", 0xC1);
        let first = builder.add_der(cert.clone()).unwrap();
        let second = builder.add_der(cert).unwrap();
        assert_eq!(first, second);
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_shared_subject_keeps_insertion_order() {
        let mut builder = IndexBuilder::new();
        let older = ca("Same Name", 0xC1);
        let newer = ca("Same Name", 0xD2);
        builder.add_der(ca("Other", 0xC1)).unwrap();
        builder.add_der(older.clone()).unwrap();
        builder.add_der(newer.clone()).unwrap();

        let mut index = MemoryStream::empty("index");
        let mut archive = MemoryStream::empty("archive");
        let summary = builder.write(&mut index, &mut archive).unwrap();
        assert_eq!(summary.shared_subjects, 1);

        let hash = IssuerHash::from_name_der(&name("Same Name"));
        let first = index.data()[HEADER_SIZE..]
            .chunks(RECORD_SIZE)
            .map(|c| IndexRecord::decode(c).unwrap())
            .find(|r| r.issuer_hash == hash)
            .unwrap();
        let der = &archive.data()[first.archive_offset as usize..first.archive_end() as usize];
        assert_eq!(der, &older[..]);
    }

    #[test]
    fn test_rejects_oversized_and_unusable() {
        let mut builder = IndexBuilder::new().with_max_certificate_size(64);
        assert!(matches!(
            builder.add_der(ca("Alpha", 0xC1)),
            Err(CSError::CertificateTooLarge { .. })
        ));

        let mut builder = IndexBuilder::new();
        assert!(builder.add_der(vec![0x30, 0x03, 0x02, 0x01, 0x00]).is_err());
        assert!(builder.is_empty());
    }

    #[test]
    fn test_pem_bundle() {
        let certs = [ca("Alpha", 0xC1), ca("Bravo", 0xC1)];
        let mut bundle = String::new();
        for der in &certs {
            bundle.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())));
        }
        bundle.push_str(&pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3])));
        bundle.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", vec![0x30, 0x00])));

        let mut builder = IndexBuilder::new();
        assert_eq!(builder.add_bundle(bundle.as_bytes()).unwrap(), 2);
        assert_eq!(builder.skipped(), 1);

        assert_eq!(builder.add_bundle(&ca("Charlie", 0xC1)).unwrap(), 1);
        assert_eq!(builder.len(), 3);
    }

    #[test]
    fn test_read_certificates_keeps_file_order() {
        let certs = [ca("Zulu", 0xC1), ca("Alpha", 0xC1)];
        let bundle: String = certs
            .iter()
            .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())))
            .collect();
        assert_eq!(read_certificates(bundle.as_bytes()).unwrap(), certs.to_vec());
        assert_eq!(read_certificates(&certs[0]).unwrap(), vec![certs[0].clone()]);
        assert!(read_certificates(b"-----BEGIN CERTIFICATE-----\nnot base64!\n-----END CERTIFICATE-----\n").is_err());
    }
}
