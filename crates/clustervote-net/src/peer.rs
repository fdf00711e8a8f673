//! One connected peer's read and write loops.
//!
//! Mirrors the original design's `rxLoop`/`runTx` split: a dedicated task
//! owns the read half and only ever decodes frames, a dedicated task owns
//! the write half and only ever encodes them. Neither touches the
//! Controller's state directly — they hand events across channels.

use async_trait::async_trait;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use clustervote_common::{ClusterError, Result};
use clustervote_core::{ClusterMessage, ConnectionEvent, DisconnectEvent, InboundMessage, PeerSink};

use crate::wire::{self, Header, Heartbeat, MessageType, VoteMsg};

/// Outbound side of a connected peer: implements [`PeerSink`] so the
/// Controller can address it without knowing about TLS or framing.
pub struct PeerHandle {
    peer_id: String,
    outbound: mpsc::Sender<ClusterMessage>,
}

#[async_trait]
impl PeerSink for PeerHandle {
    fn id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, message: ClusterMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ClusterError::Connection(format!("peer {} write queue closed", self.peer_id)))
    }
}

/// Spawn the rx/tx tasks for a newly admitted connection and report it to
/// the Controller as a [`ConnectionEvent`].
pub fn spawn<S>(
    peer_id: String,
    stream: S,
    connection_tx: &mpsc::Sender<ConnectionEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(100);
    let (read_half, write_half) = split(stream);

    tokio::spawn(rx_loop(peer_id.clone(), read_half, inbound_tx, disconnect_tx));
    tokio::spawn(tx_loop(peer_id.clone(), write_half, outbound_rx));

    let sink = std::sync::Arc::new(PeerHandle { peer_id: peer_id.clone(), outbound: outbound_tx });
    let connection_tx = connection_tx.clone();
    tokio::spawn(async move {
        let _ = connection_tx.send(ConnectionEvent { peer_id, sink }).await;
    });
}

async fn rx_loop<R>(
    peer_id: String,
    mut reader: R,
    inbound_tx: mpsc::Sender<InboundMessage>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let header: Header = match wire::read_frame(&mut reader).await {
            Ok(header) => header,
            Err(e) => {
                debug!(peer = %peer_id, "rx loop ending: {e}");
                break;
            }
        };

        let message = match MessageType::try_from(header.message_type) {
            Ok(MessageType::Heartbeat) => match wire::read_frame::<_, Heartbeat>(&mut reader).await {
                Ok(hb) => ClusterMessage::Heartbeat { view_id: hb.view_id },
                Err(e) => {
                    debug!(peer = %peer_id, "rx loop ending: {e}");
                    break;
                }
            },
            Ok(MessageType::Vote) => match wire::read_frame::<_, VoteMsg>(&mut reader).await {
                Ok(vote) => ClusterMessage::Vote { view_id: vote.view_id, peer_id: vote.peer_id },
                Err(e) => {
                    debug!(peer = %peer_id, "rx loop ending: {e}");
                    break;
                }
            },
            Err(_) => {
                debug!(peer = %peer_id, "dropping frame of unknown type");
                continue;
            }
        };

        if inbound_tx.send(InboundMessage { from: peer_id.clone(), message }).await.is_err() {
            break;
        }
    }

    let _ = disconnect_tx.send(DisconnectEvent { peer_id }).await;
}

async fn tx_loop<W>(peer_id: String, mut writer: W, mut outbound_rx: mpsc::Receiver<ClusterMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound_rx.recv().await {
        let message_type = match &message {
            ClusterMessage::Heartbeat { .. } => MessageType::Heartbeat,
            ClusterMessage::Vote { .. } => MessageType::Vote,
        };

        let result = async {
            wire::write_frame(&mut writer, &Header { message_type: message_type as i32 }).await?;
            match &message {
                ClusterMessage::Heartbeat { view_id } => {
                    wire::write_frame(&mut writer, &Heartbeat { view_id: *view_id }).await
                }
                ClusterMessage::Vote { view_id, peer_id } => {
                    wire::write_frame(&mut writer, &VoteMsg { view_id: *view_id, peer_id: peer_id.clone() }).await
                }
            }
        }
        .await;

        if result.is_err() {
            debug!(peer = %peer_id, "tx loop ending: write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn spawn_reports_a_connection_event_and_forwards_a_vote() {
        let (local, mut remote) = duplex(4096);
        let (connection_tx, mut connection_rx) = mpsc::channel(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (disconnect_tx, _disconnect_rx) = mpsc::channel(8);

        spawn("peer-a".into(), local, &connection_tx, inbound_tx, disconnect_tx);

        let connected = connection_rx.recv().await.unwrap();
        assert_eq!(connected.peer_id, "peer-a");

        wire::write_frame(&mut remote, &Header { message_type: MessageType::Vote as i32 }).await.unwrap();
        wire::write_frame(&mut remote, &VoteMsg { view_id: 3, peer_id: "b".into() }).await.unwrap();

        let inbound = inbound_rx.recv().await.unwrap();
        assert_eq!(inbound.from, "peer-a");
        assert_eq!(inbound.message, ClusterMessage::Vote { view_id: 3, peer_id: "b".into() });
    }

    #[tokio::test]
    async fn send_writes_header_then_payload_adjacently() {
        let (local, mut remote) = duplex(4096);
        let (connection_tx, mut connection_rx) = mpsc::channel(8);
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let (disconnect_tx, _disconnect_rx) = mpsc::channel(8);

        spawn("peer-b".into(), local, &connection_tx, inbound_tx, disconnect_tx);
        let connected = connection_rx.recv().await.unwrap();

        connected.sink.send(ClusterMessage::Heartbeat { view_id: 5 }).await.unwrap();

        let header: Header = wire::read_frame(&mut remote).await.unwrap();
        assert_eq!(header.message_type, MessageType::Heartbeat as i32);
        let hb: Heartbeat = wire::read_frame(&mut remote).await.unwrap();
        assert_eq!(hb.view_id, 5);
    }

    #[tokio::test]
    async fn rx_eof_reports_a_disconnect() {
        let (local, remote) = duplex(4096);
        let (connection_tx, _connection_rx) = mpsc::channel(8);
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let (disconnect_tx, mut disconnect_rx) = mpsc::channel(8);

        spawn("peer-c".into(), local, &connection_tx, inbound_tx, disconnect_tx);
        drop(remote);

        let disconnected = disconnect_rx.recv().await.unwrap();
        assert_eq!(disconnected.peer_id, "peer-c");
    }
}
