//! Leader selection.

use dvq_types::{Height, OperatorId, Round, Share};

/// Picks the proposer for a (height, round).
pub trait LeaderSelector: Send + Sync {
    fn leader(&self, height: Height, round: Round) -> OperatorId;
}

/// Round-robin rotation over the committee's ordered operator list:
/// `committee[(height + round - 1) mod N]`. With the conventional committee
/// `{1..N}` this is `((height + round - 1) mod N) + 1`.
#[derive(Debug, Clone)]
pub struct RoundRobinLeader {
    committee: Vec<OperatorId>,
}

impl RoundRobinLeader {
    pub fn new(share: &Share) -> RoundRobinLeader {
        RoundRobinLeader {
            committee: share.operator_ids(),
        }
    }
}

impl LeaderSelector for RoundRobinLeader {
    fn leader(&self, height: Height, round: Round) -> OperatorId {
        let n = self.committee.len() as u64;
        let index = (height.0 + round.0 - 1) % n;
        self.committee[index as usize]
    }
}
