//! rustls integration
//!
//! [`IndexedCertVerifier`] plugs the store into a rustls client as its
//! server certificate verifier. For each handshake it finds the topmost
//! certificate the peer sent that is not self-issued, looks up the CA that
//! issued it, and hands that single trust anchor to webpki for the full
//! path check (signatures, validity, key usage, name).
//!
//! Every failure rejects the certificate. An issuer missing from the store,
//! a storage error and an unreadable stored certificate are reported with
//! different rustls errors so they can be told apart in logs.

use crate::anchor::{certificate_names, issuer_hash_of};
use crate::error::CSError;
use crate::store::CertStore;
use crate::stream::ByteStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A store shared by every connection that verifies against it.
///
/// Lookups take `&mut self`, so concurrent handshakes are serialized here.
pub type SharedCertStore<I, A> = Arc<Mutex<CertStore<I, A>>>;

impl<I: ByteStream, A: ByteStream> CertStore<I, A> {
    /// Wrap the store for use by [`IndexedCertVerifier`].
    pub fn into_shared(self) -> SharedCertStore<I, A> {
        Arc::new(Mutex::new(self))
    }
}

/// Server certificate verifier backed by a [`CertStore`]
pub struct IndexedCertVerifier<I: ByteStream, A: ByteStream> {
    store: SharedCertStore<I, A>,
    crypto_provider: Arc<CryptoProvider>,
}

impl<I: ByteStream, A: ByteStream> IndexedCertVerifier<I, A> {
    pub fn new(store: SharedCertStore<I, A>, crypto_provider: Arc<CryptoProvider>) -> Self {
        Self {
            store,
            crypto_provider,
        }
    }

    /// Index into `[end_entity, intermediates..]` of the certificate whose
    /// issuer must come from the store.
    ///
    /// Trailing self-issued certificates are roots the peer chose to send
    /// along; they are never trusted because the peer sent them.
    fn topmost_untrusted(
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<usize, TlsError> {
        let mut top = intermediates.len();
        while top > 0 {
            let names = certificate_names(&intermediates[top - 1])
                .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
            if !names.is_self_issued() {
                break;
            }
            top -= 1;
        }
        // The end entity is parsed either way, to reject garbage early.
        certificate_names(end_entity)
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
        Ok(top)
    }

    fn lookup(&self, cert: &CertificateDer<'_>) -> Result<rustls::pki_types::TrustAnchor<'static>, TlsError> {
        let issuer_hash = issuer_hash_of(cert)
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;

        let found = {
            let mut store = self
                .store
                .lock()
                .map_err(|_| TlsError::General("certificate store lock poisoned".to_string()))?;
            store.find_trust_anchor_by_issuer_hash(&issuer_hash)
        };

        match found {
            Ok(Some(anchor)) => Ok(anchor.to_pki_types().clone()),
            Ok(None) => {
                log::warn!("No trust anchor for issuer {}", issuer_hash);
                Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer))
            }
            Err(e) => {
                log::error!("Trust anchor lookup for {} failed: {}", issuer_hash, e);
                Err(lookup_error(e))
            }
        }
    }
}

fn lookup_error(error: CSError) -> TlsError {
    if error.is_parse_failure() {
        TlsError::InvalidCertificate(CertificateError::BadEncoding)
    } else {
        TlsError::General(format!("certificate store unavailable: {}", error))
    }
}

fn pki_error(error: webpki::Error) -> TlsError {
    use webpki::Error;
    let cert_error = match error {
        Error::BadDer { .. } | Error::BadDerTime { .. } | Error::TrailingData { .. } => {
            CertificateError::BadEncoding
        }
        Error::CertNotValidYet { .. } => CertificateError::NotValidYet,
        Error::CertExpired { .. } => CertificateError::Expired,
        Error::UnknownIssuer { .. } => CertificateError::UnknownIssuer,
        Error::CertNotValidForName { .. } => CertificateError::NotValidForName,
        Error::InvalidSignatureForPublicKey { .. }
        | Error::UnsupportedSignatureAlgorithm { .. }
        | Error::UnsupportedSignatureAlgorithmForPublicKey { .. } => CertificateError::BadSignature,
        e => CertificateError::Other(rustls::OtherError(Arc::new(e))),
    };
    TlsError::InvalidCertificate(cert_error)
}

impl<I: ByteStream, A: ByteStream> fmt::Debug for IndexedCertVerifier<I, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedCertVerifier")
            .field("store", &"CertStore")
            .finish()
    }
}

impl<I, A> ServerCertVerifier for IndexedCertVerifier<I, A>
where
    I: ByteStream + Send + 'static,
    A: ByteStream + Send + 'static,
{
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let top = Self::topmost_untrusted(end_entity, intermediates)?;
        let topmost = if top == 0 {
            end_entity
        } else {
            &intermediates[top - 1]
        };
        let anchor = self.lookup(topmost)?;

        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(pki_error)?;
        cert.verify_for_usage(
            self.crypto_provider.signature_verification_algorithms.all,
            &[anchor],
            &intermediates[..top],
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(pki_error)?;
        cert.verify_is_valid_for_subject_name(server_name)
            .map_err(pki_error)?;

        log::debug!("Server certificate for {:?} verified", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto_provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client configuration that verifies servers against `store`.
pub fn client_config<I, A>(
    store: SharedCertStore<I, A>,
    crypto_provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, CSError>
where
    I: ByteStream + Send + 'static,
    A: ByteStream + Send + 'static,
{
    let verifier = Arc::new(IndexedCertVerifier::new(store, crypto_provider.clone()));
    let config = ClientConfig::builder_with_provider(crypto_provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CSError::InvalidArgument(format!("TLS configuration rejected: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}
