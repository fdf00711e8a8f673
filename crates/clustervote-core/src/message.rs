//! Payload types carried over peer connections. `clustervote-net` owns the
//! wire encoding; this crate only needs the logical shape so the Controller
//! can stay transport-agnostic.

/// A message exchanged between cluster members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    /// Sent by the leader on its heartbeat ticker.
    Heartbeat { view_id: i64 },
    /// A vote for `peer_id` as leader of `view_id`.
    Vote { view_id: i64, peer_id: String },
}
