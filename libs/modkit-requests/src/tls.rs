//! TLS configuration for the transport.
//!
//! The OS trust store is read once per process. Verification can be switched
//! off per client, in which case [`NoVerifier`] accepts any server certificate.

use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::{Arc, OnceLock};

use crate::error::HttpError;

static TRUST_ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();

fn load_trust_roots() -> Arc<RootCertStore> {
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        tracing::warn!(error = %err, "failed to read part of the OS certificate store");
    }

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        tracing::warn!(added, ignored, "skipped unparsable OS root certificates");
    }
    if store.is_empty() {
        tracing::warn!("OS trust store is empty; verified handshakes will fail");
    } else {
        tracing::debug!(roots = store.len(), "OS trust store loaded");
    }

    Arc::new(store)
}

/// OS trust anchors, read on first use and shared by every client after that.
/// The store may be empty.
#[must_use]
pub fn native_trust_roots() -> Arc<RootCertStore> {
    Arc::clone(TRUST_ROOTS.get_or_init(load_trust_roots))
}

/// Use the globally installed provider if there is one, otherwise a private
/// aws-lc-rs provider (nothing is installed globally).
#[must_use]
pub fn get_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Build the rustls client configuration for the given verification mode.
///
/// With `verify == true` the OS root store is trusted. An empty or unparsable
/// store is logged and leaves every handshake to fail with an unknown-issuer
/// error rather than failing client construction.
///
/// # Errors
///
/// Returns [`HttpError::Tls`] if the provider rejects the default protocol
/// versions.
pub fn client_config(verify: bool) -> Result<rustls::ClientConfig, HttpError> {
    let provider = get_crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(Box::new(e)))?;

    let config = if verify {
        builder
            .with_root_certificates(native_trust_roots())
            .with_no_client_auth()
    } else {
        tracing::warn!("TLS certificate verification disabled; server identity is not checked");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(provider)))
            .with_no_client_auth()
    };

    Ok(config)
}

/// Accepts every server certificate. Handshake signatures are still checked
/// against the presented certificate key.
#[derive(Debug)]
pub struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl NoVerifier {
    #[must_use]
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
