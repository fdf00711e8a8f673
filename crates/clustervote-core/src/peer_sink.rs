//! Seams the Controller reaches through to talk to the transport layer
//! without depending on it. `clustervote-net` provides the implementations.

use async_trait::async_trait;
use clustervote_common::Result;

use crate::message::ClusterMessage;

/// A live, writable handle to one connected peer.
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// The peer's identity id.
    fn id(&self) -> &str;

    /// Enqueue `message` for delivery to this peer.
    async fn send(&self, message: ClusterMessage) -> Result<()>;
}

/// Lets the Controller ask for a disconnected peer to be redialed, without
/// owning the dial/accept logic itself.
pub trait Redialer: Send + Sync {
    fn redial(&self, peer_id: &str);
}
