pub mod context_cache;

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_native_certs as native_certs;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TlsContextError {
    #[error("failed to read certificate authority file '{path}': {source}")]
    CaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate authority file '{path}' contains no usable certificates")]
    EmptyCa { path: String },
    #[error("no trust anchors available; install system certificates or provide a custom bundle")]
    NoTrustAnchors,
    #[error("tls configuration rejected: {0}")]
    Build(#[from] rustls::Error),
}

/// A freshly built client context plus whether it is safe to publish in the
/// context cache. Contexts built from an incomplete trust store are usable
/// but non-cacheable, so later callers retry the build fresh.
pub struct BuiltContext {
    pub config: Arc<ClientConfig>,
    pub cacheable: bool,
}

/// Builds a TLS client context. `certificate_authority` is a path to a PEM
/// bundle; an empty string selects the system trust store. `verify = false`
/// disables server certificate verification entirely (the signature checks
/// still run so the handshake stays well-formed).
pub fn build_client_config(
    verify: bool,
    certificate_authority: &str,
) -> Result<BuiltContext, TlsContextError> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone().into())
        .with_safe_default_protocol_versions()?;

    let mut cacheable = true;
    let mut config = if !verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DisabledVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        if certificate_authority.is_empty() {
            let loaded = native_certs::load_native_certs();
            for error in &loaded.errors {
                warn!(error = %error, "error loading a system trust anchor");
            }
            let (added, ignored) = root_store.add_parsable_certificates(loaded.certs);
            if ignored > 0 {
                warn!(ignored, "ignored invalid system trust anchors");
            }
            if added == 0 {
                return Err(TlsContextError::NoTrustAnchors);
            }
            // Partial trust stores may heal (e.g. after a certificate
            // refresh on disk); do not pin them in the cache.
            cacheable = loaded.errors.is_empty() && ignored == 0;
        } else {
            let file = File::open(certificate_authority).map_err(|source| {
                TlsContextError::CaRead {
                    path: certificate_authority.to_string(),
                    source,
                }
            })?;
            let mut reader = BufReader::new(file);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<Result<_, _>>()
                .map_err(|source| TlsContextError::CaRead {
                    path: certificate_authority.to_string(),
                    source,
                })?;
            let (added, _ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(TlsContextError::EmptyCa {
                    path: certificate_authority.to_string(),
                });
            }
        }
        builder
            .with_root_certificates(Arc::new(root_store))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(BuiltContext {
        config: Arc::new(config),
        cacheable,
    })
}

/// Accepts any server certificate. Only reachable when a backend was
/// explicitly configured with `verify = false`.
#[derive(Debug)]
struct DisabledVerification(CryptoProvider);

impl ServerCertVerifier for DisabledVerification {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
