//! End-to-end tests of the certificate store over its storage backends

use castore::{
    extract_trust_anchor, BlockStream, ByteStream, CSError, CertStore, FileStream, IndexBuilder,
    IndexRecord, IssuerHash, MemoryBlockDevice, MemoryStream, OpenMode, StoreConfig,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::env;
use std::path::PathBuf;
use x509_parser::prelude::{FromDer, X509Certificate};

const HEADER: &[u8] = b"CAIX\x01\x00\x00\x00";

fn ca_der(common_name: &str, organization: &str) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(DnType::OrganizationName, organization);
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.self_signed(&key).unwrap().der().to_vec()
}

fn build(certs: &[Vec<u8>]) -> (MemoryStream, MemoryStream) {
    build_into(
        certs,
        MemoryStream::empty("index").with_access_log(),
        MemoryStream::empty("archive").with_access_log(),
    )
}

fn build_into(
    certs: &[Vec<u8>],
    mut index: MemoryStream,
    mut archive: MemoryStream,
) -> (MemoryStream, MemoryStream) {
    let mut builder = IndexBuilder::new();
    for der in certs {
        builder.add_der(der.clone()).unwrap();
    }
    builder.write(&mut index, &mut archive).unwrap();
    (index, archive)
}

fn subject_hash(der: &[u8]) -> IssuerHash {
    let (_, cert) = X509Certificate::from_der(der).unwrap();
    IssuerHash::from_name_der(cert.subject().as_raw())
}

/// Index of `count` records whose hashes are 1, 3, 5, ... so every even
/// value falls strictly between two neighbours.
fn synthetic_index(count: u64) -> Vec<u8> {
    let mut data = HEADER.to_vec();
    for i in 0..count {
        data.extend_from_slice(&IndexRecord::new(odd_hash(i), i as u32, 0).encode());
    }
    data
}

fn odd_hash(i: u64) -> IssuerHash {
    numbered_hash(2 * i + 1)
}

fn numbered_hash(n: u64) -> IssuerHash {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&n.to_be_bytes());
    IssuerHash(hash)
}

fn synthetic_store(count: u64) -> CertStore<MemoryStream, MemoryStream> {
    let mut store = CertStore::new(
        MemoryStream::new("index", synthetic_index(count)).with_access_log(),
        MemoryStream::empty("archive"),
        StoreConfig::default(),
    );
    assert_eq!(store.initialize(), count as usize);
    store
}

fn probe_bound(count: u64) -> u32 {
    // ceil(log2(count)) + 1
    let mut bound = 1;
    while (1u64 << (bound - 1)) < count {
        bound += 1;
    }
    bound
}

fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!("castore_test_store_{}_{}", std::process::id(), name))
}

#[test]
fn test_three_record_scenario() {
    let certs = vec![
        ca_der("Alpha Root", "Alpha Trust"),
        ca_der("Bravo Root", "Bravo Trust"),
        ca_der("Charlie Root", "Charlie Trust"),
    ];
    let (index, archive) = build(&certs);

    let mut sorted: Vec<(IssuerHash, &Vec<u8>)> = certs.iter().map(|c| (subject_hash(c), c)).collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let (h2, cert2) = sorted[1];
    let h3 = sorted[2].0;

    let mut store = CertStore::new(index, archive, StoreConfig::default());
    assert_eq!(store.initialize(), 3);
    assert!(store.archive().access_log().is_empty());

    let anchor = store.find_trust_anchor_by_issuer_hash(&h2).unwrap().unwrap();
    let (_, parsed) = X509Certificate::from_der(cert2).unwrap();
    assert_eq!(anchor.subject, parsed.subject().as_raw());
    assert_eq!(
        anchor.subject_public_key_info,
        parsed.tbs_certificate.subject_pki.raw
    );

    // The archive was read exactly over [O2, O2 + L2).
    let record = store.find_record(&h2).unwrap().unwrap();
    let start = record.archive_offset as u64;
    assert_eq!(store.archive().access_log(), &[start..start + cert2.len() as u64]);
    assert_eq!(record.length as usize, cert2.len());

    let mut h4 = [0xFFu8; 32];
    h4[31] = 0xFE;
    let h4 = IssuerHash(h4);
    assert!(h4 > h3);
    assert!(store.find_trust_anchor_by_issuer_hash(&h4).unwrap().is_none());
    assert!(store.last_lookup_stats().index_probes <= 2);
}

#[test]
fn test_every_stored_ca_is_found() {
    let certs: Vec<Vec<u8>> = (0..12)
        .map(|i| ca_der(&format!("Root {}", i), "Example Trust"))
        .collect();
    let (index, archive) = build(&certs);
    let mut store = CertStore::new(index, archive, StoreConfig::development());
    assert_eq!(store.initialize(), certs.len());

    for der in &certs {
        let hash = subject_hash(der);
        let anchor = store.find_trust_anchor_by_issuer_hash(&hash).unwrap().unwrap();
        assert_eq!(anchor, extract_trust_anchor(der).unwrap());
        assert!(store.last_lookup_stats().index_probes <= probe_bound(certs.len() as u64));
        assert_eq!(store.last_lookup_stats().archive_bytes_read, der.len() as u64);
    }
}

#[test]
fn test_probe_bound_and_gaps() {
    for count in [1u64, 2, 3, 4, 5, 7, 8, 9, 16, 31, 100, 257, 1000] {
        let mut store = synthetic_store(count);
        let bound = probe_bound(count);

        for i in 0..count {
            let record = store.find_record(&odd_hash(i)).unwrap().unwrap();
            assert_eq!(record.archive_offset as u64, i);
            assert!(
                store.last_lookup_stats().index_probes <= bound,
                "{} probes for record {} of {}",
                store.last_lookup_stats().index_probes,
                i,
                count
            );
        }
        for gap in 0..=count {
            assert!(store.find_record(&numbered_hash(2 * gap)).unwrap().is_none());
            assert!(store.last_lookup_stats().index_probes <= bound);
        }
    }
}

#[test]
fn test_probes_read_whole_records() {
    let mut store = synthetic_store(64);
    store.find_record(&odd_hash(17)).unwrap().unwrap();
    for range in store.index().access_log().iter().skip(1) {
        assert_eq!(range.end - range.start, 40);
        assert_eq!((range.start - 8) % 40, 0);
    }
}

#[test]
fn test_duplicate_hashes_first_wins() {
    // Runs of equal hashes; the offset records the position.
    let mut data = HEADER.to_vec();
    let runs = [3u64, 1, 4, 1, 5, 9, 2, 6];
    let mut firsts = Vec::new();
    let mut position = 0u32;
    for (value, run) in runs.iter().enumerate() {
        firsts.push(position);
        for _ in 0..*run {
            data.extend_from_slice(&IndexRecord::new(numbered_hash(value as u64), position, 0).encode());
            position += 1;
        }
    }
    let mut store = CertStore::new(
        MemoryStream::new("index", data),
        MemoryStream::empty("archive"),
        StoreConfig::default().with_order_verification(),
    );
    assert_eq!(store.initialize(), position as usize);

    for (value, first) in firsts.iter().enumerate() {
        let record = store.find_record(&numbered_hash(value as u64)).unwrap().unwrap();
        assert_eq!(record.archive_offset, *first);
    }
}

#[test]
fn test_duplicate_subjects_first_added_wins() {
    let older = ca_der("Shared Root", "Example Trust");
    let newer = ca_der("Shared Root", "Example Trust");
    assert_ne!(older, newer);
    let (index, archive) = build(&[older.clone(), newer]);

    let mut store = CertStore::new(index, archive, StoreConfig::default());
    assert_eq!(store.initialize(), 2);
    let anchor = store
        .find_trust_anchor_by_issuer_hash(&subject_hash(&older))
        .unwrap()
        .unwrap();
    assert_eq!(anchor, extract_trust_anchor(&older).unwrap());
}

#[test]
fn test_truncated_index_is_unusable() {
    let (index, archive) = build(&[ca_der("Alpha Root", "Alpha Trust")]);
    let mut data = index.into_inner();
    data.pop();

    let mut store = CertStore::new(
        MemoryStream::new("index", data),
        archive,
        StoreConfig::default(),
    );
    assert_eq!(store.initialize(), 0);
    assert_eq!(store.record_count(), 0);

    let err = store
        .find_trust_anchor_by_issuer_hash(&IssuerHash([0; 32]))
        .unwrap_err();
    assert!(matches!(err, CSError::NotReady));
    assert!(err.is_io_failure());
}

#[test]
fn test_index_shorter_than_header() {
    let mut store = CertStore::new(
        MemoryStream::new("index", b"CAIX".to_vec()),
        MemoryStream::empty("archive"),
        StoreConfig::default(),
    );
    assert_eq!(store.initialize(), 0);
}

#[test]
fn test_read_failure_mid_search() {
    let mut store = CertStore::new(
        // One header read, then two probes succeed.
        MemoryStream::new("index", synthetic_index(100)).with_failing_reads_after(3),
        MemoryStream::empty("archive"),
        StoreConfig::default(),
    );
    assert_eq!(store.initialize(), 100);
    let err = store.find_record(&odd_hash(3)).unwrap_err();
    assert!(err.is_io_failure());
    assert_eq!(store.last_lookup_stats().index_probes, 2);
}

#[test]
fn test_busy_storage_is_retried() {
    let (index, archive) = build(&[
        ca_der("Alpha Root", "Alpha Trust"),
        ca_der("Bravo Root", "Bravo Trust"),
    ]);

    let index = MemoryStream::new("index", index.into_inner()).with_would_block_every(2);
    let archive = MemoryStream::new("archive", archive.into_inner())
        .with_would_block_every(3)
        .with_short_reads(100);
    let mut store = CertStore::new(index, archive, StoreConfig::default().with_read_retries(1));
    assert_eq!(store.initialize(), 2);

    let hash = subject_hash(&ca_der_from_store(&mut store, 0));
    assert!(store.find_trust_anchor_by_issuer_hash(&hash).unwrap().is_some());
}

fn ca_der_from_store(store: &mut CertStore<MemoryStream, MemoryStream>, position: u64) -> Vec<u8> {
    let record = store.record_at(position).unwrap();
    let archive = store.archive().data();
    archive[record.archive_offset as usize..record.archive_end() as usize].to_vec()
}

/// A backend whose reads stop early past `cutoff`, while still reporting
/// the full length.
struct TruncatingStream {
    inner: MemoryStream,
    cutoff: u64,
    pos: u64,
}

impl ByteStream for TruncatingStream {
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError> {
        self.pos = 0;
        self.inner.open(mode)
    }

    fn seek(&mut self, offset: u64) -> Result<(), CSError> {
        self.pos = offset;
        self.inner.seek(offset)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError> {
        if self.pos >= self.cutoff {
            return Ok(0);
        }
        let allowed = buf.len().min((self.cutoff - self.pos) as usize);
        let n = self.inner.read(&mut buf[..allowed])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, CSError> {
        self.inner.write(buf)
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn len(&mut self) -> Result<u64, CSError> {
        self.inner.len()
    }

    fn name(&self) -> &str {
        "truncating"
    }
}

#[test]
fn test_short_archive_read_is_io_failure() {
    let der = ca_der("Alpha Root", "Alpha Trust");
    let (index, archive) = build(&[der.clone()]);
    let archive = TruncatingStream {
        inner: archive,
        cutoff: der.len() as u64 - 10,
        pos: 0,
    };

    let mut store = CertStore::new(index, archive, StoreConfig::default());
    assert_eq!(store.initialize(), 1);
    let err = store
        .find_trust_anchor_by_issuer_hash(&subject_hash(&der))
        .unwrap_err();
    assert!(matches!(err, CSError::ShortRead { .. }));
    assert!(err.is_io_failure());
}

#[test]
fn test_oversized_certificate_is_reported() {
    let der = ca_der("Alpha Root", "Alpha Trust");
    let (index, archive) = build(&[der.clone()]);
    let config = StoreConfig::default().with_max_certificate_size(der.len() - 1);
    let mut store = CertStore::new(index, archive, config);
    assert_eq!(store.initialize(), 1);

    let err = store
        .find_trust_anchor_by_issuer_hash(&subject_hash(&der))
        .unwrap_err();
    assert!(err.is_parse_failure());
    assert!(store.archive().access_log().is_empty());
}

#[test]
fn test_memory_is_constant_across_lookups() {
    let certs: Vec<Vec<u8>> = (0..8)
        .map(|i| ca_der(&format!("Root {}", i), "Example Trust"))
        .collect();
    let (index, archive) = build_into(
        &certs,
        MemoryStream::empty("index"),
        MemoryStream::empty("archive"),
    );
    let config = StoreConfig::default().with_max_certificate_size(3000);
    let mut store = CertStore::new(index, archive, config);
    assert_eq!(store.initialize(), certs.len());

    let hashes: Vec<IssuerHash> = certs.iter().map(|c| subject_hash(c)).collect();
    store.find_trust_anchor_by_issuer_hash(&hashes[0]).unwrap().unwrap();
    let index_bytes = store.index().heap_bytes();
    let archive_bytes = store.archive().heap_bytes();

    for round in 0..200 {
        let hash = &hashes[round % hashes.len()];
        store.find_trust_anchor_by_issuer_hash(hash).unwrap().unwrap();
        store.find_trust_anchor_by_issuer_hash(&numbered_hash(round as u64)).unwrap();
    }
    assert_eq!(store.index().heap_bytes(), index_bytes);
    assert_eq!(store.archive().heap_bytes(), archive_bytes);
    assert_eq!(store.scratch_capacity(), 3000);
}

#[test]
fn test_scratch_capacity_does_not_depend_on_record_count() {
    let config = StoreConfig::default().with_max_certificate_size(3000);
    let mut small = CertStore::new(
        MemoryStream::new("index", synthetic_index(1)),
        MemoryStream::empty("archive"),
        config.clone(),
    );
    let mut large = CertStore::new(
        MemoryStream::new("index", synthetic_index(5000)),
        MemoryStream::empty("archive"),
        config,
    );
    assert_eq!(small.initialize(), 1);
    assert_eq!(large.initialize(), 5000);
    assert_eq!(small.scratch_capacity(), large.scratch_capacity());
}

#[test]
fn test_file_backend() {
    let index_path = temp_path("index");
    let archive_path = temp_path("archive");
    let certs = [
        ca_der("Alpha Root", "Alpha Trust"),
        ca_der("Bravo Root", "Bravo Trust"),
    ];

    let mut builder = IndexBuilder::new();
    for der in &certs {
        builder.add_der(der.clone()).unwrap();
    }
    builder
        .write(
            &mut FileStream::new(&index_path),
            &mut FileStream::new(&archive_path),
        )
        .unwrap();

    let mut store = CertStore::open_files(&index_path, &archive_path, StoreConfig::development());
    assert_eq!(store.initialize(), 2);
    for der in &certs {
        assert!(store
            .find_trust_anchor_by_issuer_hash(&subject_hash(der))
            .unwrap()
            .is_some());
    }
    store.close();

    let _ = std::fs::remove_file(&index_path);
    let _ = std::fs::remove_file(&archive_path);

    let mut missing = CertStore::open_files(&index_path, &archive_path, StoreConfig::default());
    assert_eq!(missing.initialize(), 0);
}

#[test]
fn test_block_device_backend() {
    let certs: Vec<Vec<u8>> = (0..6)
        .map(|i| ca_der(&format!("Flash Root {}", i), "Flash Trust"))
        .collect();

    let mut index = BlockStream::new(MemoryBlockDevice::new(256, 8), 0, 8, "flash-index");
    let mut archive = BlockStream::new(MemoryBlockDevice::new(512, 64), 0, 64, "flash-archive");
    let mut builder = IndexBuilder::new();
    for der in &certs {
        builder.add_der(der.clone()).unwrap();
    }
    builder.write(&mut index, &mut archive).unwrap();

    // Reboot: only the raw images survive.
    let index_image = index.into_device().into_image();
    let archive_image = archive.into_device().into_image();
    let index = BlockStream::new(MemoryBlockDevice::from_image(256, index_image), 0, 8, "flash-index");
    let archive = BlockStream::new(
        MemoryBlockDevice::from_image(512, archive_image),
        0,
        64,
        "flash-archive",
    );

    let mut store = CertStore::new(index, archive, StoreConfig::embedded());
    assert_eq!(store.initialize(), certs.len());
    for der in &certs {
        let anchor = store
            .find_trust_anchor_by_issuer_hash(&subject_hash(der))
            .unwrap()
            .unwrap();
        assert_eq!(anchor, extract_trust_anchor(der).unwrap());
    }
    assert!(store
        .find_trust_anchor_by_issuer_hash(&IssuerHash([0x5A; 32]))
        .unwrap()
        .is_none());
}
