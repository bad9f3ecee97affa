use tracing::error;

use ketch_base::LOG_TARGET;
use ketch_model::{Epoch, State};
use ketch_net::{Common, LeasePrepareReq, LeasePrepareResp, LeaseProposeReq, LeaseProposeResp};

use crate::constants::LEASE_GRACE;

fn swap_common(req: &Common) -> Common {
    Common {
        dest_id: req.src_id,
        src_id: req.dest_id,
        replica_id: req.replica_id,
        epoch_id: req.epoch_id,
    }
}

fn epoch_in_known_state(state: State) -> bool {
    matches!(state, State::New | State::Open | State::Closed)
}

/// Acceptor side of a prepare round. Returns the response to send and
/// whether `epoch` was mutated and needs to be persisted.
pub fn on_lease_prepare_req(epoch: &mut Epoch, req: &LeasePrepareReq, uptime: i64) -> (LeasePrepareResp, bool) {
    let mut resp = LeasePrepareResp {
        common: swap_common(&req.common),
        ballot_number: req.ballot_number,
        highest_promised: epoch.acceptor.highest_promised,
        proposal_owner_id: None,
        successor_mismatch: true,
    };

    if !epoch_in_known_state(epoch.common.state) {
        error!(target: LOG_TARGET, epoch_id = %epoch.common.id, state = ?epoch.common.state, "lease prepare request for epoch in unexpected state");
        return (resp, false);
    }

    let mut mutated = false;
    if epoch.acceptor.highest_promised.less_than(&req.ballot_number) {
        epoch.acceptor.highest_promised = req.ballot_number;
        mutated = true;
    }
    resp.highest_promised = epoch.acceptor.highest_promised;

    if uptime < epoch.acceptor.proposal_expire_uptime {
        resp.proposal_owner_id = epoch.acceptor.proposal_owner_id;
    }

    resp.successor_mismatch = match epoch.successor_epoch_id {
        Some(successor) => req.successor_epoch_id != Some(successor),
        None => false,
    };
    if resp.successor_mismatch {
        error!(target: LOG_TARGET, epoch_id = %epoch.common.id, "lease prepare request successor doesn't match");
    }

    (resp, mutated)
}

/// Acceptor side of a propose round. Returns `None` when the epoch is in
/// a state that forbids a response at all (the original silently drops
/// the request in that case rather than answering with a placeholder).
pub fn on_lease_propose_req(epoch: &mut Epoch, req: &LeaseProposeReq, uptime: i64) -> Option<(LeaseProposeResp, bool)> {
    if !epoch_in_known_state(epoch.common.state) {
        error!(target: LOG_TARGET, epoch_id = %epoch.common.id, state = ?epoch.common.state, "lease propose request for epoch in unexpected state");
        return None;
    }

    let mut mutated = false;
    if !req.ballot_number.less_than(&epoch.acceptor.highest_promised) {
        epoch.acceptor.proposal_expire_uptime = uptime + req.proposed_timeout as i64 + LEASE_GRACE as i64;
        epoch.acceptor.proposal_owner_id = Some(req.common.src_id);
        mutated = true;
    }

    let mut resp = LeaseProposeResp {
        common: swap_common(&req.common),
        ballot_number: req.ballot_number,
        has_accepted_proposal: false,
        proposal_owner_id: None,
        epoch_state: epoch.common.state,
    };
    if uptime < epoch.acceptor.proposal_expire_uptime {
        resp.has_accepted_proposal = true;
        resp.proposal_owner_id = epoch.acceptor.proposal_owner_id;
    }

    Some((resp, mutated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::{AcceptorState, BallotNumber, Common as ResourceCommon};
    use uuid::Uuid;

    fn new_epoch(replica_id: Uuid) -> Epoch {
        Epoch {
            common: ResourceCommon { id: Uuid::new_v4(), state: State::New, ..Default::default() },
            replica_id,
            successor_epoch_id: None,
            acceptor: AcceptorState::default(),
        }
    }

    fn msg_common(epoch: &Epoch) -> Common {
        Common { dest_id: epoch.common.id, src_id: Uuid::new_v4(), replica_id: epoch.replica_id, epoch_id: epoch.common.id }
    }

    #[test]
    fn higher_ballot_advances_promise() {
        let mut epoch = new_epoch(Uuid::new_v4());
        let ballot = BallotNumber { sequence: 1, server_id: Uuid::new_v4() };
        let req = LeasePrepareReq { common: msg_common(&epoch), ballot_number: ballot, successor_epoch_id: None };

        let (resp, mutated) = on_lease_prepare_req(&mut epoch, &req, 0);
        assert!(mutated);
        assert_eq!(resp.highest_promised, ballot);
        assert!(!resp.successor_mismatch);
    }

    #[test]
    fn mismatched_successor_is_flagged() {
        let mut epoch = new_epoch(Uuid::new_v4());
        let successor = Uuid::new_v4();
        epoch.successor_epoch_id = Some(successor);
        let req = LeasePrepareReq {
            common: msg_common(&epoch),
            ballot_number: BallotNumber::default(),
            successor_epoch_id: Some(Uuid::new_v4()),
        };

        let (resp, _) = on_lease_prepare_req(&mut epoch, &req, 0);
        assert!(resp.successor_mismatch);
    }

    #[test]
    fn prepare_echoes_live_proposal_owner() {
        let mut epoch = new_epoch(Uuid::new_v4());
        let owner = Uuid::new_v4();
        epoch.acceptor.proposal_owner_id = Some(owner);
        epoch.acceptor.proposal_expire_uptime = 100;
        let req = LeasePrepareReq {
            common: msg_common(&epoch),
            ballot_number: BallotNumber { sequence: 1, server_id: Uuid::new_v4() },
            successor_epoch_id: None,
        };

        let (resp, _) = on_lease_prepare_req(&mut epoch, &req, 0);
        assert_eq!(resp.proposal_owner_id, Some(owner));
    }

    #[test]
    fn prepare_omits_expired_proposal_owner() {
        let mut epoch = new_epoch(Uuid::new_v4());
        epoch.acceptor.proposal_owner_id = Some(Uuid::new_v4());
        epoch.acceptor.proposal_expire_uptime = 100;
        let req = LeasePrepareReq {
            common: msg_common(&epoch),
            ballot_number: BallotNumber { sequence: 1, server_id: Uuid::new_v4() },
            successor_epoch_id: None,
        };

        let (resp, _) = on_lease_prepare_req(&mut epoch, &req, 200);
        assert_eq!(resp.proposal_owner_id, None);
    }

    #[test]
    fn propose_below_promise_is_rejected() {
        let mut epoch = new_epoch(Uuid::new_v4());
        epoch.acceptor.highest_promised = BallotNumber { sequence: 5, server_id: Uuid::new_v4() };
        let req = LeaseProposeReq {
            common: msg_common(&epoch),
            ballot_number: BallotNumber { sequence: 1, server_id: Uuid::new_v4() },
            proposed_timeout: 9,
        };

        let (resp, mutated) = on_lease_propose_req(&mut epoch, &req, 0).unwrap();
        assert!(!mutated);
        assert!(!resp.has_accepted_proposal);
    }

    #[test]
    fn propose_meeting_promise_is_accepted() {
        let mut epoch = new_epoch(Uuid::new_v4());
        let ballot = BallotNumber { sequence: 1, server_id: Uuid::new_v4() };
        epoch.acceptor.highest_promised = ballot;
        let req = LeaseProposeReq { common: msg_common(&epoch), ballot_number: ballot, proposed_timeout: 9 };

        let (resp, mutated) = on_lease_propose_req(&mut epoch, &req, 0).unwrap();
        assert!(mutated);
        assert!(resp.has_accepted_proposal);
        assert_eq!(resp.proposal_owner_id, Some(req.common.src_id));
    }
}
