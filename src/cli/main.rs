use castore::reexports::log;
use castore::reexports::rustls::client::danger::ServerCertVerifier;
use castore::reexports::rustls::crypto::ring as ring_provider;
use castore::{
    issuer_hash_of, read_certificates, CSError, CertStore, FileStream, IndexBuilder,
    IndexedCertVerifier, IssuerHash, StoreConfig,
};

use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, ArgMatches, Command};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::Arc;

/// Read a whole file with a readable error
fn read_file(path: impl AsRef<Path>) -> Result<Vec<u8>, CSError> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|e| {
        CSError::InternalError(format!("Failed to read file '{}': {}", path.display(), e))
    })
}

/// Create the parent directories of an output file
fn create_parent_dirs(path: impl AsRef<Path>) -> Result<(), CSError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            CSError::InternalError(format!(
                "Failed to create parent directory for '{}': {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn store_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("index")
                .value_name("index_file")
                .long("index")
                .short('x')
                .required(true)
                .help("Index file"),
        )
        .arg(
            Arg::new("archive")
                .value_name("archive_file")
                .long("archive")
                .short('a')
                .required(true)
                .help("Certificate archive file"),
        )
}

fn open_store(
    matches: &ArgMatches,
    config: StoreConfig,
) -> Result<CertStore<FileStream, FileStream>, CSError> {
    let index = matches
        .get_one::<String>("index")
        .ok_or(CSError::UsageError("Missing index file"))?;
    let archive = matches
        .get_one::<String>("archive")
        .ok_or(CSError::UsageError("Missing archive file"))?;
    let mut store = CertStore::open_files(index, archive, config);
    store.try_initialize()?;
    Ok(store)
}

fn start() -> Result<(), CSError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .arg(
            Arg::new("max_cert_size")
                .long("max-cert-size")
                .value_name("bytes")
                .value_parser(clap::value_parser!(usize))
                .help("Largest certificate the store accepts (scratch buffer size)"),
        )
        .subcommand(
            store_args(
                Command::new("build")
                    .about("Build an index and archive from CA certificates")
                    .arg(
                        Arg::new("bundle")
                            .value_name("bundle_file")
                            .long("bundle")
                            .short('b')
                            .required(true)
                            .action(ArgAction::Append)
                            .help("PEM bundle or DER certificate (repeatable)"),
                    ),
            ),
        )
        .subcommand(
            store_args(Command::new("info").about("Summarize a store")).arg(
                Arg::new("check")
                    .long("check")
                    .action(ArgAction::SetTrue)
                    .help("Check ordering and parse every stored certificate"),
            ),
        )
        .subcommand(
            store_args(
                Command::new("lookup")
                    .about("Find the trust anchor for an issuer")
                    .arg(
                        Arg::new("hash")
                            .long("hash")
                            .value_name("hex")
                            .conflicts_with("cert")
                            .help("Issuer hash (64 hex characters)"),
                    )
                    .arg(
                        Arg::new("cert")
                            .long("cert")
                            .value_name("cert_file")
                            .help("Certificate whose issuer to look up (PEM or DER)"),
                    ),
            ),
        )
        .subcommand(
            store_args(
                Command::new("verify-chain")
                    .about("Verify a server certificate chain against the store")
                    .arg(
                        Arg::new("chain")
                            .long("chain")
                            .short('c')
                            .value_name("chain_file")
                            .required(true)
                            .help("PEM chain, end-entity certificate first"),
                    )
                    .arg(
                        Arg::new("server_name")
                            .long("server-name")
                            .short('n')
                            .value_name("dns_name")
                            .required(true)
                            .help("Expected server name"),
                    ),
            ),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let mut config = StoreConfig::development().with_yield_between_probes(false);
    if let Some(size) = matches.get_one::<usize>("max_cert_size") {
        config = config.with_max_certificate_size(*size);
    }

    if let Some(matches) = matches.subcommand_matches("build") {
        let index = matches
            .get_one::<String>("index")
            .ok_or(CSError::UsageError("Missing index file"))?;
        let archive = matches
            .get_one::<String>("archive")
            .ok_or(CSError::UsageError("Missing archive file"))?;

        let mut builder =
            IndexBuilder::new().with_max_certificate_size(config.max_certificate_size);
        for bundle in matches.get_many::<String>("bundle").into_iter().flatten() {
            let added = builder.add_bundle(&read_file(bundle)?)?;
            if verbose {
                println!("{}: {} certificates", bundle, added);
            }
        }
        if builder.is_empty() {
            return Err(CSError::UsageError("No usable certificates in the input"));
        }

        create_parent_dirs(index)?;
        create_parent_dirs(archive)?;
        let summary = builder.write(&mut FileStream::new(index), &mut FileStream::new(archive))?;
        println!(
            "{} certificates, index {} bytes, archive {} bytes",
            summary.certificates, summary.index_bytes, summary.archive_bytes
        );
        if builder.skipped() > 0 || summary.shared_subjects > 0 {
            println!(
                "{} skipped, {} sharing a subject with an earlier certificate",
                builder.skipped(),
                summary.shared_subjects
            );
        }
    } else if let Some(matches) = matches.subcommand_matches("info") {
        let check = matches.get_flag("check");
        let config = if check {
            config.with_order_verification()
        } else {
            StoreConfig {
                verify_order: false,
                ..config
            }
        };
        let mut store = open_store(matches, config)?;
        println!("Records:          {}", store.record_count());
        println!("Scratch buffer:   {} bytes", store.scratch_capacity());

        if check || verbose {
            let mut failures = 0;
            for position in 0..store.record_count() {
                let record = store.record_at(position)?;
                match store.trust_anchor_for(&record) {
                    Ok(anchor) if anchor.subject_hash() == record.issuer_hash => {
                        if verbose {
                            println!(
                                "{}  {:>7} {:>5}  {:<12} {}",
                                record.issuer_hash,
                                record.archive_offset,
                                record.length,
                                anchor.public_key.algorithm(),
                                anchor.subject_display()
                            );
                        }
                    }
                    Ok(anchor) => {
                        failures += 1;
                        eprintln!(
                            "record {}: stored under {} but subject hashes to {}",
                            position,
                            record.issuer_hash,
                            anchor.subject_hash()
                        );
                    }
                    Err(e) => {
                        failures += 1;
                        eprintln!("record {}: {}", position, e);
                    }
                }
            }
            if failures > 0 {
                return Err(CSError::Corrupt(format!("{} unusable records", failures)));
            }
            if check {
                println!("All records usable");
            }
        }
    } else if let Some(matches) = matches.subcommand_matches("lookup") {
        let issuer_hash = if let Some(hex_hash) = matches.get_one::<String>("hash") {
            IssuerHash::from_hex(hex_hash)?
        } else if let Some(cert_file) = matches.get_one::<String>("cert") {
            let certs = read_certificates(&read_file(cert_file)?)?;
            let cert = certs
                .first()
                .ok_or(CSError::UsageError("No certificate in the input file"))?;
            issuer_hash_of(cert)?
        } else {
            return Err(CSError::UsageError("Either --hash or --cert is required"));
        };

        let mut store = open_store(matches, config)?;
        let found = store.find_trust_anchor_by_issuer_hash(&issuer_hash)?;
        let stats = store.last_lookup_stats();
        match found {
            Some(anchor) => {
                println!("Issuer hash:  {}", issuer_hash);
                println!("Subject:      {}", anchor.subject_display());
                println!("Key:          {}", anchor.public_key.algorithm());
                if verbose {
                    println!(
                        "Cost:         {} index probes, {} archive bytes",
                        stats.index_probes, stats.archive_bytes_read
                    );
                }
            }
            None => {
                println!(
                    "No trust anchor for {} ({} index probes)",
                    issuer_hash, stats.index_probes
                );
                std::process::exit(2);
            }
        }
    } else if let Some(matches) = matches.subcommand_matches("verify-chain") {
        let chain_file = matches
            .get_one::<String>("chain")
            .ok_or(CSError::UsageError("Missing chain file"))?;
        let dns_name = matches
            .get_one::<String>("server_name")
            .ok_or(CSError::UsageError("Missing server name"))?;
        let server_name = ServerName::try_from(dns_name.clone())
            .map_err(|e| CSError::InvalidArgument(format!("invalid server name: {}", e)))?;

        let mut chain: Vec<CertificateDer<'static>> = read_certificates(&read_file(chain_file)?)?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        if chain.is_empty() {
            return Err(CSError::UsageError("No certificate in the chain file"));
        }
        let end_entity = chain.remove(0);

        let store = open_store(matches, config)?;
        let verifier =
            IndexedCertVerifier::new(store.into_shared(), Arc::new(ring_provider::default_provider()));
        match verifier.verify_server_cert(&end_entity, &chain, &server_name, &[], UnixTime::now()) {
            Ok(_) => println!("Chain verified for {}", dns_name),
            Err(e) => {
                eprintln!("Chain rejected: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        return Err(CSError::UsageError("No subcommand given (try --help)"));
    }
    Ok(())
}

fn main() -> Result<(), CSError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
