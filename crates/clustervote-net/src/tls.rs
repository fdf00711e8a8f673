//! Mutual TLS between cluster members, without a certificate authority.
//!
//! Each member's trust anchor is its own certificate, pinned in the
//! membership file. A peer is accepted if, and only if, it presents exactly
//! the certificate on file and signs the handshake with the matching key —
//! chain-of-trust verification never enters into it, because there is no
//! chain.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use clustervote_common::{ClusterError, Identity, Result};

/// Verifies a presented certificate is both self-signed (internally
/// consistent) and a known member of the cluster, in either TLS role.
#[derive(Debug)]
struct PinnedRoster {
    members: Vec<Identity>,
}

impl PinnedRoster {
    fn check(&self, cert_der: &CertificateDer<'_>) -> std::result::Result<(), TlsError> {
        let identity = Identity::derive(cert_der.as_ref())
            .map_err(|e| TlsError::General(format!("certificate rejected: {e}")))?;

        if self.members.iter().any(|m| m.id() == identity.id()) {
            Ok(())
        } else {
            Err(TlsError::General(format!("unknown peer identity {}", identity.id())))
        }
    }
}

fn verify_tls12_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    rustls::crypto::verify_tls12_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn verify_tls13_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    rustls::crypto::verify_tls13_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn supported_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Used client-side: the "server" in a TLS handshake is whichever peer
/// accepted the TCP connection, not necessarily the cluster leader.
#[derive(Debug)]
struct ServerVerifier(PinnedRoster);

impl ServerCertVerifier for ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        if !intermediates.is_empty() {
            return Err(TlsError::General("peer presented a certificate chain; expected a single self-signed cert".into()));
        }
        self.0.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Used server-side: verifies whichever peer dialed in.
#[derive(Debug)]
struct ClientVerifier(PinnedRoster);

impl ClientCertVerifier for ClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, TlsError> {
        if !intermediates.is_empty() {
            return Err(TlsError::General("peer presented a certificate chain; expected a single self-signed cert".into()));
        }
        self.0.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Loads this node's certificate and key, and builds the acceptor/connector
/// pair used for every peer connection.
pub struct TlsMaterial {
    own_cert: CertificateDer<'static>,
    own_key: PrivateKeyDer<'static>,
    members: Vec<Identity>,
}

impl TlsMaterial {
    pub fn new(own_cert_der: Vec<u8>, key_path: &std::path::Path, members: Vec<Identity>) -> Result<Self> {
        let key_buf = std::fs::read(key_path)
            .map_err(|e| ClusterError::Config(format!("failed to open key file: {e}")))?;
        let mut reader = key_buf.as_slice();
        let own_key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ClusterError::Config(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| ClusterError::Config("no private key found in key file".into()))?;

        Ok(Self { own_cert: CertificateDer::from(own_cert_der), own_key, members })
    }

    fn roster(&self) -> PinnedRoster {
        PinnedRoster { members: self.members.clone() }
    }

    /// Build the acceptor used for inbound connections (server role).
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let verifier = Arc::new(ClientVerifier(self.roster()));
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.own_cert.clone()], self.own_key.clone_key())
            .map_err(|e| ClusterError::Config(format!("failed to build TLS server config: {e}")))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Build the connector used for outbound connections (client role).
    pub fn connector(&self) -> Result<TlsConnector> {
        let verifier = Arc::new(ServerVerifier(self.roster()));
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(vec![self.own_cert.clone()], self.own_key.clone_key())
            .map_err(|e| ClusterError::Config(format!("failed to build TLS client config: {e}")))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Parses `host:port` into a rustls [`ServerName`] for SNI. The server name
/// is never used to decide trust — only [`ServerVerifier`] does that — but
/// rustls requires one to start a handshake.
pub fn server_name_from_host_port(host_port: &str) -> Result<ServerName<'static>> {
    let host = host_port
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(host_port);
    ServerName::try_from(host.to_string())
        .map_err(|e| ClusterError::Config(format!("invalid peer address {host_port}: {e}")))
}

/// Default redial backoff after a failed dial, carried over from the
/// original implementation's fixed 5-second sleep.
pub const REDIAL_BACKOFF: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_for_sni() {
        let name = server_name_from_host_port("node-a.internal:4001").unwrap();
        assert!(format!("{name:?}").contains("node-a.internal"));
    }

    #[test]
    fn rejects_garbage_certificate() {
        let roster = PinnedRoster { members: vec![] };
        let der = CertificateDer::from(vec![1, 2, 3]);
        assert!(roster.check(&der).is_err());
    }
}
