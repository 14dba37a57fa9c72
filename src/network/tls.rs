//! TLS termination for the HTTPS endpoints
//!
//! Moonlight performs mutual TLS with the certificate it minted at
//! pairing time. Any client certificate is accepted at the handshake;
//! authorization happens at the application layer by verifying the
//! presented certificate against the paired set. Rejecting unknown certs
//! here would also lock out clients that are mid-pairing.

use std::sync::Arc;

use openssl::x509::X509;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::identity::HostIdentity;
use crate::error::{Result, ServerError};

#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

/// Acceptor presenting the host identity and requesting (not requiring)
/// a client certificate.
pub fn build_acceptor(identity: &HostIdentity) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut identity.cert_pem().as_bytes())
            .collect::<std::io::Result<_>>()?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut identity.key_pem().as_bytes())?
            .ok_or_else(|| ServerError::Transient("host key PEM has no private key".into()))?;

    let provider = rustls::crypto::ring::default_provider();
    let verifier = Arc::new(AcceptAnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    });
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Transient(format!("tls protocol setup: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Transient(format!("tls identity setup: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Certificate the peer presented during the handshake, if any.
pub fn peer_certificate(stream: &TlsStream<TcpStream>) -> Option<X509> {
    let (_, connection) = stream.get_ref();
    let der = connection.peer_certificates()?.first()?;
    X509::from_der(der.as_ref()).ok()
}
