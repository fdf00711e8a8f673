//! Dials and accepts peer connections per the cluster's symmetry-breaking
//! rule: of any two members, the one with the lexicographically smaller id
//! dials, and the larger one listens. This guarantees exactly one TCP
//! connection forms per pair, with no coordination beyond the roster both
//! sides already have.
//!
//! A peer's certificate Subject CommonName doubles as its `host:port` dial
//! address.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use x509_parser::prelude::*;

use clustervote_common::{ClusterError, Identity, Result};
use clustervote_core::{ConnectionEvent, DisconnectEvent, InboundMessage, Redialer};

use crate::tls::{self, TlsMaterial};
use crate::wire::{self, Negotiate, NEGOTIATE_MAGIC, PROTOCOL_VERSION};

/// Extracts a certificate's Subject CommonName, used throughout as the
/// `host:port` a member listens/dials on.
pub fn common_name(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ClusterError::Certificate { reason: format!("failed to parse certificate: {e}") })?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ClusterError::Certificate { reason: "certificate has no Subject CommonName".into() });
    name
}

/// Owns the listener (if any) and the outstanding dial tasks for one node's
/// peer set.
pub struct ConnectionManager {
    self_id: String,
    tls: Arc<TlsMaterial>,
    dial_targets: std::collections::HashMap<String, String>,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
    self_weak: std::sync::Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Starts the listener (when this node is not the smallest id in the
    /// cluster) and kicks off an initial dial for every peer it is the
    /// client of. Returns the manager so the Controller can ask it to
    /// redial later.
    pub fn start(
        self_identity: &Identity,
        peers: &[Identity],
        tls: TlsMaterial,
        listen_addr: String,
        connection_tx: mpsc::Sender<ConnectionEvent>,
        inbound_tx: mpsc::Sender<InboundMessage>,
        disconnect_tx: mpsc::Sender<DisconnectEvent>,
    ) -> Result<Arc<Self>> {
        let tls = Arc::new(tls);

        let mut servers = Vec::new(); // peers we accept from (smaller id than us)
        let mut dial_targets = std::collections::HashMap::new();

        for peer in peers {
            let address = common_name(peer.certificate())?;
            if peer.id() < self_identity.id() {
                servers.push(peer.id().to_string());
            } else {
                dial_targets.insert(peer.id().to_string(), address);
            }
        }

        let manager = Arc::new_cyclic(|weak| Self {
            self_id: self_identity.id().to_string(),
            tls,
            dial_targets,
            connection_tx,
            inbound_tx,
            disconnect_tx,
            self_weak: weak.clone(),
        });

        if !servers.is_empty() {
            let manager = manager.clone();
            let servers: std::collections::HashSet<String> = servers.into_iter().collect();
            tokio::spawn(async move { manager.listen(listen_addr, servers).await });
        }

        for peer_id in manager.dial_targets.keys().cloned().collect::<Vec<_>>() {
            manager.redial(&peer_id);
        }

        Ok(manager)
    }

    async fn listen(self: Arc<Self>, addr: String, expected: std::collections::HashSet<String>) {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("failed to bind listener on {addr}: {e}");
                return;
            }
        };
        info!("listening on {addr}");

        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let manager = self.clone();
            let expected = expected.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.accept_one(socket, &expected).await {
                    warn!("dropping connection from {remote}: {e}");
                }
            });
        }
    }

    async fn accept_one(&self, socket: TcpStream, expected: &std::collections::HashSet<String>) -> Result<()> {
        let acceptor = self.tls.acceptor()?;
        let mut stream = acceptor
            .accept(socket)
            .await
            .map_err(|e| ClusterError::Connection(format!("TLS accept failed: {e}")))?;

        let (_, server_conn) = stream.get_ref();
        let peer_cert = server_conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ClusterError::Connection("peer presented no certificate".into()))?;
        let peer_id = Identity::derive(peer_cert.as_ref())?.id().to_string();

        if !expected.contains(&peer_id) {
            return Err(ClusterError::Connection(format!("unexpected peer {peer_id}")));
        }

        negotiate(&mut stream).await?;

        crate::peer::spawn(peer_id, stream, &self.connection_tx, self.inbound_tx.clone(), self.disconnect_tx.clone());
        Ok(())
    }

    async fn dial_one(&self, peer_id: String, address: String) -> Result<()> {
        let socket = TcpStream::connect(&address)
            .await
            .map_err(|e| ClusterError::Connection(format!("dial {address} failed: {e}")))?;

        let connector = self.tls.connector()?;
        let server_name = tls::server_name_from_host_port(&address)?;
        let mut stream = connector
            .connect(server_name, socket)
            .await
            .map_err(|e| ClusterError::Connection(format!("TLS connect to {address} failed: {e}")))?;

        let (_, client_conn) = stream.get_ref();
        let peer_cert = client_conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ClusterError::Connection("peer presented no certificate".into()))?;
        let presented_id = Identity::derive(peer_cert.as_ref())?.id().to_string();

        if presented_id != peer_id {
            return Err(ClusterError::Connection(format!(
                "dialed {peer_id} but peer presented identity {presented_id}"
            )));
        }

        negotiate(&mut stream).await?;

        crate::peer::spawn(peer_id, stream, &self.connection_tx, self.inbound_tx.clone(), self.disconnect_tx.clone());
        Ok(())
    }
}

impl Redialer for ConnectionManager {
    fn redial(&self, peer_id: &str) {
        let Some(address) = self.dial_targets.get(peer_id).cloned() else {
            // We only redial peers we are the dialing side for.
            return;
        };
        let Some(manager) = self.self_weak.upgrade() else {
            return;
        };

        let self_id = self.self_id.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            loop {
                match manager.dial_one(peer_id.clone(), address.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(self_id, peer_id, "redial attempt failed: {e}");
                        tokio::time::sleep(tls::REDIAL_BACKOFF).await;
                    }
                }
            }
        });
    }
}

async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    wire::write_frame(stream, &Negotiate { magic: NEGOTIATE_MAGIC.to_string(), version: PROTOCOL_VERSION }).await?;
    let peer: Negotiate = wire::read_frame(stream).await?;

    if peer.magic != NEGOTIATE_MAGIC {
        return Err(ClusterError::Connection(format!("peer is not speaking the clustervote protocol (magic {:?})", peer.magic)));
    }
    if peer.version != PROTOCOL_VERSION {
        return Err(ClusterError::Connection(format!(
            "protocol version mismatch: we speak {PROTOCOL_VERSION}, peer speaks {}",
            peer.version
        )));
    }
    Ok(())
}
