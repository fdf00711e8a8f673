//! The Election Manager: accumulates votes across a changing set of
//! connected peers, produces a stable "contender" from partial
//! information, and commits a leader once quorum agrees.
//!
//! State machine:
//!
//! | State | Event | Next | Action |
//! |---|---|---|---|
//! | idle | quorum | electing | emit `ElectionStarted` |
//! | electing | complete(leader,view) | elected | store leader/view, clear votes, emit `LeaderElected` |
//! | elected | next | idle | increment view |
//!
//! The observed "channel of bool" signalling is replaced by the [`EmEvent`]
//! sum type so the Controller's handler can be exhaustive.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use clustervote_common::quorum;

use crate::vote::Vote;

/// Notifications the Election Manager emits to its observer (the Controller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmEvent {
    /// Quorum of distinct voters reached; an election is now in progress.
    ElectionStarted,
    /// A candidate accumulated enough votes to be committed as leader.
    LeaderElected { peer_id: String, view_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EmState {
    Idle,
    Electing,
    Elected { leader: String },
}

/// Error returned by Election Manager queries/admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("leader unknown")]
    LeaderUnknown,
    #[error("no candidates present")]
    NoCandidates,
    #[error("stale vote")]
    StaleVote,
}

/// Maintains the current view, accumulates votes, and reports the
/// contender/leader for this node's view of the cluster.
pub struct ElectionManager {
    state: EmState,
    view: i64,
    /// Votes keyed by voter id — each voter contributes at most one current vote.
    votes: HashMap<String, Vote>,
    /// The earliest vote received in the current cycle; wins ties where every
    /// voter disagrees.
    first: Option<Vote>,
    threshold: usize,
    tx: mpsc::Sender<EmEvent>,
}

impl ElectionManager {
    /// Create a manager for a membership of `member_count` nodes (total `N`,
    /// self included), returning it paired with the receiving end of its
    /// notification channel (capacity 100).
    pub fn new(member_count: usize) -> (Self, mpsc::Receiver<EmEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let manager = Self {
            state: EmState::Idle,
            view: 0,
            votes: HashMap::new(),
            first: None,
            threshold: quorum::threshold(member_count),
            tx,
        };
        (manager, rx)
    }

    /// The current leader, if one has been committed for the current view.
    pub fn current(&self) -> Result<String, ElectionError> {
        match &self.state {
            EmState::Elected { leader } => Ok(leader.clone()),
            _ => Err(ElectionError::LeaderUnknown),
        }
    }

    /// The current view number.
    pub fn view(&self) -> i64 {
        self.view
    }

    /// Number of distinct voters currently accumulated.
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// The provisional best candidate while an election has not yet
    /// committed: the candidate with the most votes, or — if every voter
    /// disagrees (max tally of 1) — the earliest-received vote of the cycle.
    /// Ties above 1 are broken by lexicographically smallest peer id, for
    /// determinism.
    pub fn get_contender(&self) -> Result<(String, i64), ElectionError> {
        if self.votes.is_empty() {
            return Err(ElectionError::NoCandidates);
        }

        let mut tally: HashMap<&str, (usize, i64)> = HashMap::new();
        for vote in self.votes.values() {
            let entry = tally.entry(vote.peer_id.as_str()).or_insert((0, i64::MIN));
            entry.0 += 1;
            if vote.view_id > entry.1 {
                entry.1 = vote.view_id;
            }
        }

        let max = tally.values().map(|(count, _)| *count).max().unwrap_or(0);

        if max == 1 {
            let first = self.first.as_ref().expect("votes non-empty implies first set");
            return Ok((first.peer_id.clone(), first.view_id));
        }

        tally
            .into_iter()
            .filter(|(_, (count, _))| *count == max)
            .map(|(peer_id, (_, view_id))| (peer_id.to_string(), view_id))
            .min_by(|a, b| a.0.cmp(&b.0))
            .ok_or(ElectionError::NoCandidates)
    }

    /// Admit a vote cast by `from` endorsing `peer_id` for `view_id`.
    ///
    /// Rejected (stale) when `view_id < self.view`, or `view_id ==
    /// self.view` while a leader is already committed for this view.
    pub fn process_vote(&mut self, from: &str, peer_id: &str, view_id: i64) -> Result<(), ElectionError> {
        if view_id < self.view || (view_id == self.view && matches!(self.state, EmState::Elected { .. })) {
            debug!(from, peer_id, view_id, current_view = self.view, "rejecting stale vote");
            return Err(ElectionError::StaleVote);
        }

        let prev_count = self.votes.len();
        let vote = Vote::new(view_id, peer_id);

        if prev_count == 0 {
            self.first = Some(vote.clone());
        }
        self.votes.insert(from.to_string(), vote);

        let curr_count = self.votes.len();

        if curr_count != prev_count && curr_count == self.threshold.saturating_sub(1) && self.state == EmState::Idle
        {
            self.state = EmState::Electing;
            info!("election started");
            let _ = self.tx.try_send(EmEvent::ElectionStarted);
        }

        self.try_commit();

        Ok(())
    }

    /// Tally all held votes by endorsed peer; commit whichever candidate (if
    /// any) has reached quorum. Ties cannot exceed threshold simultaneously
    /// because the threshold is a strict majority.
    fn try_commit(&mut self) {
        if self.state != EmState::Electing {
            return;
        }

        let mut tally: HashMap<String, (usize, i64)> = HashMap::new();
        for vote in self.votes.values() {
            let entry = tally.entry(vote.peer_id.clone()).or_insert((0, i64::MIN));
            entry.0 += 1;
            if vote.view_id > entry.1 {
                entry.1 = vote.view_id;
            }
        }

        if let Some((leader, (_, max_view))) = tally.into_iter().find(|(_, (count, _))| *count >= self.threshold) {
            self.commit(leader, max_view);
        }
    }

    fn commit(&mut self, leader: String, view: i64) {
        info!(leader = %leader, view, "election complete");
        self.state = EmState::Elected { leader: leader.clone() };
        self.view = view;
        self.votes.clear();
        self.first = None;
        let _ = self.tx.try_send(EmEvent::LeaderElected { peer_id: leader, view_id: view });
    }

    /// Remove `peer_id`'s cast vote (it disconnected). If `peer_id` was the
    /// current leader, this is a `leader-lost` transition (`elected` →
    /// `idle`, with the same view-increment effect as [`Self::next_view`]);
    /// returns `true` in that case so the Controller can react.
    pub fn invalidate(&mut self, peer_id: &str) -> bool {
        self.votes.remove(peer_id);

        if let EmState::Elected { leader } = &self.state {
            if leader == peer_id {
                self.leave_elected();
                return true;
            }
        }
        false
    }

    /// Leave `elected` and start the next view.
    pub fn next_view(&mut self) {
        if matches!(self.state, EmState::Elected { .. }) {
            self.leave_elected();
        }
    }

    fn leave_elected(&mut self) {
        self.view += 1;
        self.state = EmState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> (ElectionManager, mpsc::Receiver<EmEvent>) {
        ElectionManager::new(n)
    }

    /// Scenario 1 — minimal election: N=5, members A..E.
    #[test]
    fn minimal_election() {
        let (mut em, _rx) = manager(5);

        assert!(em.current().is_err());
        assert_eq!(em.view(), 0);

        em.process_vote("A", "B", 1).unwrap();
        em.process_vote("B", "B", 1).unwrap();
        em.process_vote("C", "B", 1).unwrap();

        assert_eq!(em.current().unwrap(), "B");
        assert_eq!(em.view(), 1);

        let err = em.process_vote("D", "B", 1).unwrap_err();
        assert_eq!(err, ElectionError::StaleVote);
    }

    /// Scenario 2 — tie with max == 1: first-received vote wins.
    #[test]
    fn tie_with_all_voters_disagreeing() {
        let (mut em, _rx) = manager(5);

        em.process_vote("A", "B", 1).unwrap();
        em.process_vote("B", "C", 1).unwrap();
        em.process_vote("C", "D", 1).unwrap();

        let (peer, view) = em.get_contender().unwrap();
        assert_eq!(peer, "B");
        assert_eq!(view, 1);
    }

    /// Scenario 3 — tie with max > 1.
    #[test]
    fn tie_broken_by_larger_tally() {
        let (mut em, _rx) = manager(5);

        em.process_vote("A", "B", 1).unwrap();
        em.process_vote("B", "C", 1).unwrap();
        em.process_vote("C", "B", 1).unwrap();

        let (peer, _view) = em.get_contender().unwrap();
        assert_eq!(peer, "B");
    }

    /// Scenario 4 — leader loss forces the manager back to idle, and the
    /// next election proceeds from the incremented view.
    #[test]
    fn leader_loss_forces_new_view() {
        let (mut em, _rx) = manager(5);
        em.process_vote("A", "B", 1).unwrap();
        em.process_vote("B", "B", 1).unwrap();
        em.process_vote("C", "B", 1).unwrap();
        assert_eq!(em.current().unwrap(), "B");

        let leader_lost = em.invalidate("B");
        assert!(leader_lost);
        assert!(em.current().is_err());
        assert_eq!(em.view(), 2);

        // A no-op: already left `elected`.
        em.next_view();
        assert_eq!(em.view(), 2);
    }

    #[test]
    fn quorum_trigger_fires_on_threshold_minus_one_distinct_voters() {
        let (mut em, mut rx) = manager(5); // threshold = 3, trigger at 2 distinct voters
        em.process_vote("A", "B", 1).unwrap();
        assert!(rx.try_recv().is_err());
        em.process_vote("C", "D", 1).unwrap();
        assert_eq!(rx.try_recv().unwrap(), EmEvent::ElectionStarted);
    }

    #[test]
    fn contender_errors_with_no_votes() {
        let (em, _rx) = manager(5);
        assert_eq!(em.get_contender().unwrap_err(), ElectionError::NoCandidates);
    }

    #[test]
    fn commutativity_within_a_view() {
        let (mut a, _) = manager(5);
        a.process_vote("A", "B", 1).unwrap();
        a.process_vote("B", "B", 1).unwrap();
        a.process_vote("C", "B", 1).unwrap();

        let (mut b, _) = manager(5);
        b.process_vote("C", "B", 1).unwrap();
        b.process_vote("B", "B", 1).unwrap();
        b.process_vote("A", "B", 1).unwrap();

        assert_eq!(a.current(), b.current());
        assert_eq!(a.view(), b.view());
    }

    #[test]
    fn recasting_the_same_vote_is_a_noop_on_tally() {
        let (mut em, _rx) = manager(5);
        em.process_vote("A", "B", 1).unwrap();
        let before = em.vote_count();
        em.process_vote("A", "B", 1).unwrap();
        assert_eq!(em.vote_count(), before);
    }

    #[test]
    fn invalidate_then_revote_matches_fresh_state() {
        let (mut fresh, _) = manager(5);
        fresh.process_vote("B", "B", 1).unwrap();

        let (mut roundtrip, _) = manager(5);
        roundtrip.process_vote("A", "B", 1).unwrap();
        roundtrip.invalidate("A");
        roundtrip.process_vote("B", "B", 1).unwrap();

        assert_eq!(fresh.vote_count(), roundtrip.vote_count());
    }

    #[test]
    fn stale_view_always_rejected() {
        let (mut em, _) = manager(5);
        em.process_vote("A", "B", 1).unwrap();
        em.process_vote("B", "B", 1).unwrap();
        em.process_vote("C", "B", 1).unwrap(); // commits at view 1
        let err = em.process_vote("D", "B", 0).unwrap_err();
        assert_eq!(err, ElectionError::StaleVote);
    }
}
