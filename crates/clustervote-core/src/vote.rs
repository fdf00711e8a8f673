//! A vote is an immutable endorsement: "the voter endorses `peer_id` as
//! leader for view `view_id`". Votes are value-typed and accumulated keyed
//! by voter, so each peer contributes at most one current vote.

/// One peer's endorsement of a candidate leader for a given view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub view_id: i64,
    pub peer_id: String,
}

impl Vote {
    pub fn new(view_id: i64, peer_id: impl Into<String>) -> Self {
        Self {
            view_id,
            peer_id: peer_id.into(),
        }
    }
}
