//! The Controller: the per-node state machine that ties connectivity,
//! the Election Manager, and the heartbeat/election timers together.
//!
//! | Role | Event | Next |
//! |---|---|---|
//! | convening | quorum | initializing |
//! | initializing/electing/following/leading | quorum-lost | convening |
//! | initializing/following/electing | timeout | electing |
//! | following/leading | election | electing |
//! | initializing/electing | elected-self | leading |
//! | initializing/electing | elected-other | following |
//! | following | heartbeat | following (self-loop) |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use clustervote_common::quorum;

use crate::election::{ElectionManager, EmEvent};
use crate::message::ClusterMessage;
use crate::peer_sink::{PeerSink, Redialer};

/// The node's current role in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Convening,
    Initializing,
    Electing,
    Following,
    Leading,
}

/// Events the Controller's transition table reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ControllerEvent {
    Quorum,
    QuorumLost,
    Timeout,
    Election,
    ElectedSelf,
    ElectedOther,
    Heartbeat,
}

/// Pure transition function: current role + event -> next role, or `None`
/// if the event has no effect in that role.
fn transition(role: Role, event: &ControllerEvent) -> Option<Role> {
    use ControllerEvent::*;
    use Role::*;

    match (role, event) {
        (Convening, Quorum) => Some(Initializing),
        (Initializing | Electing | Following | Leading, QuorumLost) => Some(Convening),
        (Initializing | Following | Electing, Timeout) => Some(Electing),
        (Following | Leading, Election) => Some(Electing),
        (Initializing | Electing, ElectedSelf) => Some(Leading),
        (Initializing | Electing, ElectedOther) => Some(Following),
        (Following, Heartbeat) => Some(Following),
        _ => None,
    }
}

/// A newly accepted or dialed connection, handed to the Controller by the
/// net layer.
pub struct ConnectionEvent {
    pub peer_id: String,
    pub sink: Arc<dyn PeerSink>,
}

/// An inbound message read off an already-admitted peer connection.
pub struct InboundMessage {
    pub from: String,
    pub message: ClusterMessage,
}

/// A peer connection has dropped.
pub struct DisconnectEvent {
    pub peer_id: String,
}

/// Election-timer bounds, in milliseconds. The heartbeat ticker runs at
/// `min_ms / 2` while leading.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { min_ms: 500, max_ms: 1000 }
    }
}

pub struct Controller {
    self_id: String,
    quorum_threshold: usize,
    timers: TimerConfig,
    role: Role,
    current_leader: Option<String>,
    active_peers: HashMap<String, Arc<dyn PeerSink>>,
    election: ElectionManager,
    election_rx: mpsc::Receiver<EmEvent>,
    connection_rx: mpsc::Receiver<ConnectionEvent>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    disconnect_rx: mpsc::Receiver<DisconnectEvent>,
    redialer: Arc<dyn Redialer>,
    /// `None` while `convening`/`leading`, where §4.5 specifies "no timing
    /// active" for the watchdog. `Some` everywhere else.
    election_deadline: Option<Instant>,
    heartbeat: Option<tokio::time::Interval>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: String,
        member_count: usize,
        timers: TimerConfig,
        connection_rx: mpsc::Receiver<ConnectionEvent>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        disconnect_rx: mpsc::Receiver<DisconnectEvent>,
        redialer: Arc<dyn Redialer>,
    ) -> Self {
        let (election, election_rx) = ElectionManager::new(member_count);
        Self {
            self_id,
            quorum_threshold: quorum::threshold(member_count),
            timers,
            role: Role::Convening,
            current_leader: None,
            active_peers: HashMap::new(),
            election,
            election_rx,
            connection_rx,
            inbound_rx,
            disconnect_rx,
            redialer,
            election_deadline: None,
            heartbeat: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn rearm_election_timer(&mut self) {
        let ms = rand::thread_rng().gen_range(self.timers.min_ms..self.timers.max_ms);
        self.election_deadline = Some(Instant::now() + Duration::from_millis(ms));
    }

    fn apply(&mut self, event: ControllerEvent) {
        let Some(next) = transition(self.role, &event) else {
            return;
        };

        if next != self.role {
            info!(from = ?self.role, to = ?next, "role transition");
        }

        if matches!(self.role, Role::Leading) {
            self.heartbeat = None;
        }

        self.role = next;

        match self.role {
            Role::Initializing | Role::Following => self.rearm_election_timer(),
            Role::Electing => {
                self.rearm_election_timer();
                // Leave `elected` if we haven't already (e.g. a watchdog
                // timeout with no disconnect in between) so the Election
                // Manager's view is the round we're about to contest. A
                // no-op if `invalidate` already did this, or if we were
                // never elected to begin with.
                self.election.next_view();
                self.initiate_election();
            }
            Role::Leading => {
                self.election_deadline = None;
                let period = Duration::from_millis(self.timers.min_ms / 2);
                self.heartbeat = Some(tokio::time::interval(period));
                self.current_leader = Some(self.self_id.clone());
            }
            Role::Convening => {
                self.election_deadline = None;
                self.current_leader = None;
            }
        }

        if matches!(self.role, Role::Following) {
            info!("VIEW {}: FOLLOWING {}", self.election.view(), self.current_leader.as_deref().unwrap_or("?"));
        }
    }

    /// On entering `electing`: ask the Election Manager for a contender; if
    /// none exists, fall back to self. Cast that vote locally and broadcast
    /// it to every connected peer. The view contested is always the
    /// Election Manager's current view — by the time this runs, `apply` has
    /// already ensured that view is the one we mean to vote in.
    fn initiate_election(&mut self) {
        let view = self.election.view();
        let (peer_id, view_id) = match self.election.get_contender() {
            Ok((peer_id, view_id)) => (peer_id, view_id.max(view)),
            Err(_) => (self.self_id.clone(), view),
        };

        let _ = self.election.process_vote(&self.self_id, &peer_id, view_id);
        self.broadcast(ClusterMessage::Vote { view_id, peer_id });
    }

    fn broadcast(&self, message: ClusterMessage) {
        for sink in self.active_peers.values() {
            let sink = sink.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.send(message).await {
                    debug!("broadcast send failed: {e}");
                }
            });
        }
    }

    fn check_quorum(&mut self) {
        if self.active_peers.len() + 1 >= self.quorum_threshold {
            self.apply(ControllerEvent::Quorum);
        } else {
            self.apply(ControllerEvent::QuorumLost);
        }
    }

    async fn on_connection(&mut self, ev: ConnectionEvent) {
        if self.active_peers.contains_key(&ev.peer_id) {
            return;
        }

        let hint = match self.role {
            Role::Following | Role::Leading => self
                .current_leader
                .clone()
                .map(|leader| ClusterMessage::Vote { view_id: self.election.view(), peer_id: leader }),
            _ => self
                .election
                .get_contender()
                .ok()
                .map(|(peer_id, view_id)| ClusterMessage::Vote { view_id, peer_id }),
        };

        if let Some(message) = hint {
            let sink = ev.sink.clone();
            tokio::spawn(async move {
                let _ = sink.send(message).await;
            });
        }

        self.active_peers.insert(ev.peer_id, ev.sink);
        self.check_quorum();
    }

    async fn on_inbound(&mut self, msg: InboundMessage) {
        match msg.message {
            ClusterMessage::Heartbeat { view_id } => self.on_heartbeat(&msg.from, view_id),
            ClusterMessage::Vote { view_id, peer_id } => self.on_vote(&msg.from, &peer_id, view_id),
        }
    }

    fn on_heartbeat(&mut self, from: &str, view_id: i64) {
        let is_current_leader = self.current_leader.as_deref() == Some(from);
        if matches!(self.role, Role::Following) && is_current_leader && view_id == self.election.view() {
            self.apply(ControllerEvent::Heartbeat);
        }
    }

    fn on_vote(&mut self, from: &str, peer_id: &str, view_id: i64) {
        let admitted = match self.role {
            Role::Convening | Role::Initializing => true,
            Role::Electing => view_id == self.election.view(),
            Role::Following | Role::Leading => view_id == self.election.view() + 1,
        };

        if !admitted {
            debug!(from, peer_id, view_id, role = ?self.role, "dropping vote not admissible in this role");
            return;
        }

        if let Err(e) = self.election.process_vote(from, peer_id, view_id) {
            debug!("election manager rejected vote: {e}");
        }
    }

    fn on_em_event(&mut self, event: EmEvent) {
        match event {
            EmEvent::ElectionStarted => self.apply(ControllerEvent::Election),
            EmEvent::LeaderElected { peer_id, .. } => {
                self.current_leader = Some(peer_id.clone());
                if peer_id == self.self_id {
                    self.apply(ControllerEvent::ElectedSelf);
                } else {
                    self.apply(ControllerEvent::ElectedOther);
                }
            }
        }
    }

    fn on_timeout(&mut self) {
        self.apply(ControllerEvent::Timeout);
    }

    fn on_heartbeat_tick(&mut self) {
        if matches!(self.role, Role::Leading) {
            self.broadcast(ClusterMessage::Heartbeat { view_id: self.election.view() });
        }
    }

    fn on_disconnect(&mut self, peer_id: &str) {
        self.active_peers.remove(peer_id);
        let leader_lost = self.election.invalidate(peer_id);
        self.redialer.redial(peer_id);

        self.check_quorum();
        if leader_lost {
            self.apply(ControllerEvent::Election);
        }
    }

    /// Drive the Controller forever, reacting to connection, message,
    /// election, timer, and heartbeat events as they arrive.
    pub async fn run(&mut self) {
        loop {
            let heartbeat_tick = async {
                match &mut self.heartbeat {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            let election_tick = async {
                match self.election_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                ev = self.connection_rx.recv() => match ev {
                    Some(ev) => self.on_connection(ev).await,
                    None => { warn!("connection channel closed"); return; }
                },
                msg = self.inbound_rx.recv() => match msg {
                    Some(msg) => self.on_inbound(msg).await,
                    None => { warn!("inbound channel closed"); return; }
                },
                ev = self.election_rx.recv() => match ev {
                    Some(ev) => self.on_em_event(ev),
                    None => { warn!("election channel closed"); return; }
                },
                ev = self.disconnect_rx.recv() => match ev {
                    Some(ev) => self.on_disconnect(&ev.peer_id),
                    None => { warn!("disconnect channel closed"); return; }
                },
                _ = election_tick => self.on_timeout(),
                _ = heartbeat_tick => self.on_heartbeat_tick(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRedialer;
    impl Redialer for NullRedialer {
        fn redial(&self, _peer_id: &str) {}
    }

    struct RecordingSink {
        id: String,
        sent: std::sync::Mutex<Vec<ClusterMessage>>,
    }

    #[async_trait::async_trait]
    impl PeerSink for RecordingSink {
        fn id(&self) -> &str {
            &self.id
        }
        async fn send(&self, message: ClusterMessage) -> clustervote_common::Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn controller(member_count: usize) -> (Controller, mpsc::Sender<ConnectionEvent>, mpsc::Sender<DisconnectEvent>) {
        let (_c_tx, c_rx) = mpsc::channel(16);
        let (_i_tx, i_rx) = mpsc::channel(16);
        let (d_tx, d_rx) = mpsc::channel(16);
        let controller = Controller::new(
            "self".into(),
            member_count,
            TimerConfig::default(),
            c_rx,
            i_rx,
            d_rx,
            Arc::new(NullRedialer),
        );
        (controller, _c_tx, d_tx)
    }

    #[test]
    fn transition_table_matches_spec() {
        use ControllerEvent::*;
        use Role::*;

        assert_eq!(transition(Convening, &Quorum), Some(Initializing));
        assert_eq!(transition(Initializing, &QuorumLost), Some(Convening));
        assert_eq!(transition(Leading, &QuorumLost), Some(Convening));
        assert_eq!(transition(Following, &Timeout), Some(Electing));
        assert_eq!(transition(Leading, &Election), Some(Electing));
        assert_eq!(transition(Electing, &ElectedSelf), Some(Leading));
        assert_eq!(transition(Electing, &ElectedOther), Some(Following));
        assert_eq!(transition(Following, &Heartbeat), Some(Following));
        assert_eq!(transition(Convening, &Timeout), None);
        assert_eq!(transition(Leading, &ElectedSelf), None);
    }

    #[test]
    fn starts_convening() {
        let (controller, _c_tx, _d_tx) = controller(5);
        assert_eq!(controller.role(), Role::Convening);
    }

    #[tokio::test]
    async fn quorum_reached_moves_to_initializing() {
        let (mut controller, _c_tx, _d_tx) = controller(3); // threshold 2
        controller.on_connection(ConnectionEvent {
            peer_id: "b".into(),
            sink: Arc::new(RecordingSink { id: "b".into(), sent: Default::default() }),
        }).await;
        assert_eq!(controller.role(), Role::Initializing);
    }

    #[tokio::test]
    async fn quorum_lost_returns_to_convening() {
        let (mut controller, _c_tx, _d_tx) = controller(3);
        let sink = Arc::new(RecordingSink { id: "b".into(), sent: Default::default() });
        controller.on_connection(ConnectionEvent { peer_id: "b".into(), sink: sink.clone() }).await;
        assert_eq!(controller.role(), Role::Initializing);

        controller.on_disconnect("b");
        assert_eq!(controller.role(), Role::Convening);
    }

    #[tokio::test]
    async fn stale_vote_in_following_is_dropped() {
        let (mut controller, _c_tx, _d_tx) = controller(5);
        controller.role = Role::Following;
        controller.current_leader = Some("leader".into());
        // Following admits only view_id == current_view + 1 == 1.
        controller.on_vote("x", "leader", 0);
        assert_eq!(controller.election.vote_count(), 0);
    }

    #[test]
    fn convening_and_leading_have_no_election_deadline() {
        let (mut controller, _c_tx, _d_tx) = controller(5);
        assert!(controller.election_deadline.is_none());

        controller.role = Role::Leading;
        controller.apply(ControllerEvent::QuorumLost);
        assert_eq!(controller.role(), Role::Convening);
        assert!(controller.election_deadline.is_none());
    }

    #[tokio::test]
    async fn own_election_timeout_casts_a_vote_the_controller_will_itself_admit() {
        // A peer's self-cast vote on entering `electing` must land at the
        // same view the controller's own admission check expects, or an
        // election can never reach quorum.
        let (mut controller, _c_tx, _d_tx) = controller(3);
        controller.apply(ControllerEvent::Quorum); // -> initializing
        controller.apply(ControllerEvent::Timeout); // -> electing, casts self vote
        assert_eq!(controller.role(), Role::Electing);

        let self_cast_view = controller.election.view();
        controller.on_vote("peer-b", "self", self_cast_view);

        // Both the self-cast vote and the admitted peer vote landed in the
        // same view and reached quorum (threshold 2), committing "self".
        assert_eq!(controller.election.current().unwrap(), "self");
    }

    #[tokio::test]
    async fn a_timed_out_watchdog_without_disconnect_still_advances_to_a_fresh_round() {
        // Simulates a leader whose heartbeat silently stopped arriving: no
        // disconnect/invalidate runs, so the manager is still `elected`
        // when the watchdog fires.
        let (mut controller, _c_tx, _d_tx) = controller(3);
        controller.apply(ControllerEvent::Quorum);
        controller.apply(ControllerEvent::Timeout);
        let first_round_view = controller.election.view();

        controller.on_vote("peer-b", "peer-b", first_round_view);
        controller.on_vote("peer-c", "peer-b", first_round_view);
        assert_eq!(controller.election.current().unwrap(), "peer-b");

        controller.role = Role::Following;
        controller.current_leader = Some("peer-b".into());
        controller.apply(ControllerEvent::Timeout); // watchdog fires, no invalidate ran

        assert_eq!(controller.role(), Role::Electing);
        assert_eq!(controller.election.view(), first_round_view + 1);
    }
}
