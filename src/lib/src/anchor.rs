//! Trust anchor extraction from stored CA certificates
//!
//! A trust anchor is the part of a CA certificate a verifier needs: the
//! subject name (to match against the issuer of the next certificate down)
//! and the public key (to check that certificate's signature). The
//! certificate is decoded with `x509-parser`; the rustls form of the anchor
//! comes from `webpki::anchor_from_trusted_cert`.

use crate::error::CSError;
use crate::index::IssuerHash;
use rustls_pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::Oid;
use x509_parser::oid_registry::{
    OID_EC_P256, OID_KEY_TYPE_EC_PUBLIC_KEY, OID_NIST_EC_P384, OID_NIST_EC_P521,
    OID_PKCS1_RSAENCRYPTION, OID_SIG_ED25519,
};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey as ParsedKey;
use x509_parser::x509::{SubjectPublicKeyInfo, X509Name};

/// Elliptic curves accepted for EC trust anchors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedCurve {
    P256,
    P384,
    P521,
}

impl NamedCurve {
    fn from_oid(oid: &Oid<'_>) -> Option<Self> {
        if *oid == OID_EC_P256 {
            Some(NamedCurve::P256)
        } else if *oid == OID_NIST_EC_P384 {
            Some(NamedCurve::P384)
        } else if *oid == OID_NIST_EC_P521 {
            Some(NamedCurve::P521)
        } else {
            None
        }
    }

    /// Length of one field element in bytes
    pub fn coordinate_len(self) -> usize {
        match self {
            NamedCurve::P256 => 32,
            NamedCurve::P384 => 48,
            NamedCurve::P521 => 66,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NamedCurve::P256 => "P-256",
            NamedCurve::P384 => "P-384",
            NamedCurve::P521 => "P-521",
        }
    }
}

/// Public key material of a trust anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA modulus and public exponent, big-endian, without sign padding
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    /// EC point as encoded in the certificate (SEC1, compressed or not)
    Ec { curve: NamedCurve, point: Vec<u8> },
    /// Raw 32-byte Ed25519 key
    Ed25519 { key: [u8; 32] },
}

impl PublicKey {
    /// Short algorithm label for logs and the CLI
    pub fn algorithm(&self) -> String {
        match self {
            PublicKey::Rsa { modulus, .. } => {
                let bits = (modulus.len() * 8)
                    .saturating_sub(modulus.first().map_or(0, |b| b.leading_zeros() as usize));
                format!("RSA-{}", bits)
            }
            PublicKey::Ec { curve, .. } => format!("EC {}", curve.name()),
            PublicKey::Ed25519 { .. } => "Ed25519".to_string(),
        }
    }
}

/// A CA identity and key, rebuilt from the archive on every lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    /// DER-encoded subject `Name`, including tag and length
    pub subject: Vec<u8>,
    /// DER-encoded `SubjectPublicKeyInfo`, including tag and length
    pub subject_public_key_info: Vec<u8>,
    pub public_key: PublicKey,
    pki: rustls_pki_types::TrustAnchor<'static>,
}

impl TrustAnchor {
    /// The index key under which this anchor is stored.
    pub fn subject_hash(&self) -> IssuerHash {
        IssuerHash::from_name_der(&self.subject)
    }

    /// Human-readable subject, e.g. `C=US, O=Example, CN=Example Root`
    pub fn subject_display(&self) -> String {
        describe_name(&self.subject).unwrap_or_else(|_| "<unparseable name>".to_string())
    }

    /// The anchor in the form rustls and webpki verify against.
    pub fn to_pki_types(&self) -> &rustls_pki_types::TrustAnchor<'static> {
        &self.pki
    }
}

/// The names of a certificate, borrowed from its DER.
#[derive(Debug, Clone, Copy)]
pub struct CertificateNames<'a> {
    pub issuer: &'a [u8],
    pub subject: &'a [u8],
}

impl CertificateNames<'_> {
    /// Whether the certificate names itself as issuer
    pub fn is_self_issued(&self) -> bool {
        self.issuer == self.subject
    }
}

fn parse_certificate(cert_der: &[u8]) -> Result<X509Certificate<'_>, CSError> {
    let (rest, cert) = X509Certificate::from_der(cert_der).map_err(|e| {
        CSError::ParseError(format!("Failed to parse X.509 certificate: {}", e))
    })?;
    if !rest.is_empty() {
        return Err(CSError::ParseError(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }
    Ok(cert)
}

/// Raw DER issuer and subject of a certificate.
pub fn certificate_names(cert_der: &[u8]) -> Result<CertificateNames<'_>, CSError> {
    let cert = parse_certificate(cert_der)?;
    Ok(CertificateNames {
        issuer: cert.tbs_certificate.issuer.as_raw(),
        subject: cert.tbs_certificate.subject.as_raw(),
    })
}

/// Raw DER issuer `Name` of a certificate.
pub fn certificate_issuer(cert_der: &[u8]) -> Result<&[u8], CSError> {
    Ok(certificate_names(cert_der)?.issuer)
}

/// Raw DER subject `Name` of a certificate.
pub fn certificate_subject(cert_der: &[u8]) -> Result<&[u8], CSError> {
    Ok(certificate_names(cert_der)?.subject)
}

/// Hash of the certificate's issuer name: the key to look its CA up by.
pub fn issuer_hash_of(cert_der: &[u8]) -> Result<IssuerHash, CSError> {
    Ok(IssuerHash::from_name_der(certificate_names(cert_der)?.issuer))
}

/// Hash of the certificate's subject name: the key a CA is stored under.
pub fn subject_hash_of(cert_der: &[u8]) -> Result<IssuerHash, CSError> {
    Ok(IssuerHash::from_name_der(certificate_names(cert_der)?.subject))
}

/// Build a trust anchor from a DER-encoded CA certificate.
///
/// Only RSA, EC (P-256, P-384, P-521) and Ed25519 keys are accepted.
pub fn extract_trust_anchor(cert_der: &[u8]) -> Result<TrustAnchor, CSError> {
    let cert = parse_certificate(cert_der)?;
    let spki = &cert.tbs_certificate.subject_pki;
    let public_key = parse_public_key(spki)?;

    let der = CertificateDer::from(cert_der);
    let pki = webpki::anchor_from_trusted_cert(&der)
        .map_err(|e| CSError::ParseError(format!("Failed to create trust anchor: {:?}", e)))?
        .to_owned();

    Ok(TrustAnchor {
        subject: cert.tbs_certificate.subject.as_raw().to_vec(),
        subject_public_key_info: spki.raw.to_vec(),
        public_key,
        pki,
    })
}

fn parse_public_key(spki: &SubjectPublicKeyInfo<'_>) -> Result<PublicKey, CSError> {
    let algorithm = &spki.algorithm.algorithm;

    if *algorithm == OID_SIG_ED25519 {
        let bits = spki.subject_public_key.data.as_ref();
        let key: [u8; 32] = bits
            .try_into()
            .map_err(|_| CSError::ParseError(format!("Ed25519 key of {} bytes", bits.len())))?;
        return Ok(PublicKey::Ed25519 { key });
    }
    if *algorithm != OID_PKCS1_RSAENCRYPTION && *algorithm != OID_KEY_TYPE_EC_PUBLIC_KEY {
        return Err(unsupported_algorithm(algorithm));
    }

    let parsed = spki
        .parsed()
        .map_err(|e| CSError::ParseError(format!("Invalid public key: {}", e)))?;
    match parsed {
        ParsedKey::RSA(rsa) => {
            let modulus = strip_leading_zeros(rsa.modulus);
            let exponent = strip_leading_zeros(rsa.exponent);
            if modulus.len() < 64 {
                return Err(CSError::UnsupportedAlgorithm(format!(
                    "RSA modulus of {} bytes is too small",
                    modulus.len()
                )));
            }
            Ok(PublicKey::Rsa {
                modulus: modulus.to_vec(),
                exponent: exponent.to_vec(),
            })
        }
        ParsedKey::EC(point) => {
            let curve = named_curve(spki)?;
            let point = point.data();
            let coord = curve.coordinate_len();
            let valid = match point.first() {
                Some(0x04) => point.len() == 1 + 2 * coord,
                Some(0x02) | Some(0x03) => point.len() == 1 + coord,
                _ => false,
            };
            if !valid {
                return Err(CSError::ParseError(format!(
                    "malformed {} point of {} bytes",
                    curve.name(),
                    point.len()
                )));
            }
            Ok(PublicKey::Ec {
                curve,
                point: point.to_vec(),
            })
        }
        _ => Err(unsupported_algorithm(algorithm)),
    }
}

fn named_curve(spki: &SubjectPublicKeyInfo<'_>) -> Result<NamedCurve, CSError> {
    let params = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| CSError::ParseError("EC key without curve parameters".to_string()))?;
    let oid = Oid::try_from(params).map_err(|_| {
        CSError::UnsupportedAlgorithm("EC key with explicit curve parameters".to_string())
    })?;
    NamedCurve::from_oid(&oid)
        .ok_or_else(|| CSError::UnsupportedAlgorithm(format!("EC curve {}", oid.to_id_string())))
}

fn unsupported_algorithm(algorithm: &Oid<'_>) -> CSError {
    CSError::UnsupportedAlgorithm(format!(
        "public key algorithm {}",
        algorithm.to_id_string()
    ))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Render a DER `Name` as `C=.., O=.., CN=..`, in encoding order.
pub fn describe_name(name_der: &[u8]) -> Result<String, CSError> {
    let (_, name) = X509Name::from_der(name_der)
        .map_err(|e| CSError::ParseError(format!("Failed to parse name: {}", e)))?;
    Ok(name.to_string())
}
