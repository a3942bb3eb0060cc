use std::sync::Arc;

use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tracing::warn;

/// certificate verifier for connections to an address we resolved ourselves
///
/// the chain, expiry and handshake signatures are checked exactly like the stock webpki
/// verifier against the hostname we put in SNI. the only thing that can be waived is the
/// "certificate is not valid for this name" result, and only when the override is switched
/// on. this client is only ever handed allow-listed hosts
#[derive(Debug)]
pub struct PinnedHostVerifier {
    inner: Arc<WebPkiServerVerifier>,
    tolerate_name_mismatch: bool,
}

impl PinnedHostVerifier {
    pub fn new(provider: Arc<CryptoProvider>, tolerate_name_mismatch: bool) -> anyhow::Result<Self> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider).build()?;

        Ok(Self {
            inner,
            tolerate_name_mismatch,
        })
    }

    fn waives(&self, err: &TlsError) -> bool {
        self.tolerate_name_mismatch && is_name_mismatch(err)
    }
}

fn is_name_mismatch(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for PinnedHostVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(e) if self.waives(&e) => {
                warn!(
                    "Certificate for {:?} does not list the hostname, accepting pinned connection",
                    server_name
                );
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// rustls config for the pinned fetch client, http/1.1 only
pub fn pinned_client_config(tolerate_name_mismatch: bool) -> anyhow::Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedHostVerifier::new(provider.clone(), tolerate_name_mismatch)?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}
