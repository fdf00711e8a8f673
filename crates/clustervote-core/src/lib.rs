//! # Clustervote Core
//!
//! The Controller and Election Manager state machines: the decision-making
//! heart of a clustervote node, independent of how bytes actually reach a
//! peer.

pub mod controller;
pub mod election;
pub mod message;
pub mod peer_sink;
pub mod vote;

pub use controller::{Controller, ConnectionEvent, DisconnectEvent, InboundMessage, Role, TimerConfig};
pub use election::{ElectionManager, ElectionError, EmEvent};
pub use message::ClusterMessage;
pub use peer_sink::{PeerSink, Redialer};
pub use vote::Vote;
