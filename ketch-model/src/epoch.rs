use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::{Common, Resource};

/// Totally ordered `(sequence, serverId)` pair. Because the sequence is
/// persisted with the owning epoch, no separate restart counter is
/// needed: `sequence` alone survives a process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BallotNumber {
    pub sequence: u64,
    pub server_id: Uuid,
}

impl BallotNumber {
    pub fn less_than(&self, other: &BallotNumber) -> bool {
        (self.sequence, self.server_id) < (other.sequence, other.server_id)
    }
}

impl PartialOrd for BallotNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BallotNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sequence, self.server_id).cmp(&(other.sequence, other.server_id))
    }
}

/// Paxos-Lease acceptor state for one epoch on one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptorState {
    pub highest_promised: BallotNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_owner_id: Option<Uuid>,
    pub proposal_expire_uptime: i64,
}

/// Acceptor-side record for an epoch: `{id, replicaId, state,
/// pendingState, successorEpochId?, acceptor}`. Independently persisted
/// from the proposer-side `EpochSpec` embedded in a `Replica`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    #[serde(flatten)]
    pub common: Common,
    pub replica_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor_epoch_id: Option<Uuid>,
    pub acceptor: AcceptorState,
}

impl Resource for Epoch {
    fn common(&self) -> &Common {
        &self.common
    }
    fn common_mut(&mut self) -> &mut Common {
        &mut self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_order_is_lexicographic() {
        let server_lo = Uuid::from_u128(1);
        let server_hi = Uuid::from_u128(2);
        let a = BallotNumber { sequence: 10, server_id: server_lo };
        let b = BallotNumber { sequence: 10, server_id: server_hi };
        assert!(a.less_than(&b));
        assert!(!b.less_than(&a));

        let c = BallotNumber { sequence: 9, server_id: server_hi };
        assert!(c.less_than(&a));
    }
}
