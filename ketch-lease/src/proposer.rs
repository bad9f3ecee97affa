use tracing::{error, info};
use uuid::Uuid;

use ketch_base::fatal;
use ketch_model::{BallotNumber, LeasePhase, Replica, State};
use ketch_net::{Common, LeasePrepareReq, LeasePrepareResp, LeaseProposeReq, LeaseProposeResp, Msg};

use crate::constants::{LEASE_PERIOD, LEASE_RENEW_BEFORE, RETRANSMIT_INTERVAL};

fn member_in_known_state(state: State) -> bool {
    matches!(state, State::New | State::Open | State::Closed)
}

/// Starts (or renews) a prepare round for `epoch_id` on `replica`.
/// Returns whether the lease is already held for this period (in which
/// case no messages are sent) and the prepare requests to transmit
/// otherwise. Lowers `*next_period` to whatever this epoch needs next,
/// the same way the service loop accumulates a minimum wake interval
/// across every epoch it drives.
pub fn send_lease_prepare_reqs(
    replica: &mut Replica,
    epoch_id: Uuid,
    successor_epoch_id: Option<Uuid>,
    local_server_id: Uuid,
    uptime: i64,
    next_period: &mut u16,
) -> (bool, Vec<Msg>) {
    let Some(epoch) = replica.epochs.get_mut(&epoch_id) else {
        fatal(format!("send lease prepare requests for unknown epoch {epoch_id}"));
    };

    let time_to_renew = epoch.lease_expire_uptime - LEASE_RENEW_BEFORE as i64;
    if time_to_renew > 0 && uptime <= time_to_renew {
        let time_left = (time_to_renew - uptime) as u16 + RETRANSMIT_INTERVAL;
        if *next_period > time_left {
            *next_period = time_left;
        }
        return (epoch.lease_owner, Vec::new());
    }

    epoch.ballot_sequence += 1;
    epoch.ballot_number = BallotNumber { sequence: epoch.ballot_sequence, server_id: local_server_id };
    epoch.lease_phase = LeasePhase::Prepare;

    let replica_id = replica.common.id;
    let epoch = replica.epochs.get_mut(&epoch_id).expect("epoch present, checked above");

    let mut msgs = Vec::new();
    for member in epoch.quorum.iter_mut() {
        if !member_in_known_state(member.common.state) {
            error!(target: ketch_base::LOG_TARGET, member_id = %member.common.id, "send lease prepare request for member in unexpected state");
            continue;
        }
        member.accepted = false;
        member.lease_owned = false;
        msgs.push(Msg::LeasePrepareReq(LeasePrepareReq {
            common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id, epoch_id },
            ballot_number: epoch.ballot_number,
            successor_epoch_id,
        }));
    }

    if *next_period > RETRANSMIT_INTERVAL {
        *next_period = RETRANSMIT_INTERVAL;
    }

    (false, msgs)
}

/// Proposer side of a prepare response. Returns the propose requests to
/// send once a majority has accepted, or nothing while the round is
/// still pending.
pub fn on_lease_prepare_resp(
    replica: &mut Replica,
    resp: &LeasePrepareResp,
    local_server_id: Uuid,
    uptime: i64,
) -> Vec<Msg> {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: ketch_base::LOG_TARGET, "lease prepare response for unknown epoch");
        return Vec::new();
    };
    if epoch.ballot_number != resp.ballot_number {
        error!(target: ketch_base::LOG_TARGET, "lease prepare response for unknown ballot");
        return Vec::new();
    }
    if epoch.lease_phase != LeasePhase::Prepare {
        // We progress to propose on a majority, so extra prepare responses
        // after that point are expected, not an error.
        return Vec::new();
    }

    if (resp.proposal_owner_id.is_some() && resp.proposal_owner_id != Some(local_server_id)) || resp.successor_mismatch {
        error!(target: ketch_base::LOG_TARGET, "lease prepare response with conflicting proposal or successor");
        replica.common.pending_state = Some(State::Closed);
        return Vec::new();
    }

    let mut count: u32 = 0;
    let mut lease_owned = false;
    for member in epoch.quorum.iter_mut() {
        if !member_in_known_state(member.common.state) {
            error!(target: ketch_base::LOG_TARGET, member_id = %member.common.id, "lease prepare response with epoch member in unexpected state");
            continue;
        }
        if member.accepted {
            count += 1;
            continue;
        }
        if member.common.id != resp.common.src_id {
            continue;
        }
        if resp.proposal_owner_id.is_none() || resp.proposal_owner_id == Some(local_server_id) {
            if resp.proposal_owner_id.is_some() {
                member.lease_owned = true;
            }
            if member.lease_owned {
                lease_owned = true;
            }
            member.accepted = true;
            count += 1;
        } else if epoch.ballot_sequence < resp.highest_promised.sequence {
            epoch.ballot_sequence = resp.highest_promised.sequence;
        }
    }
    if count <= replica.quorum_group_size / 2 {
        return Vec::new();
    }

    if !lease_owned && epoch.lease_owner && uptime < epoch.lease_expire_uptime {
        fatal("lease expired unexpectedly");
    }

    epoch.lease_phase = LeasePhase::Propose;
    let replica_id = replica.common.id;
    let epoch_id = resp.common.epoch_id;
    let epoch = replica.epochs.get_mut(&epoch_id).expect("epoch present, checked above");

    let mut msgs = Vec::new();
    for member in epoch.quorum.iter_mut() {
        member.accepted = false;
        msgs.push(Msg::LeaseProposeReq(LeaseProposeReq {
            common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id, epoch_id },
            ballot_number: epoch.ballot_number,
            proposed_timeout: LEASE_PERIOD,
        }));
    }
    epoch.lease_expire_uptime = uptime + LEASE_PERIOD as i64;

    msgs
}

/// Proposer side of a propose response. No further messages result; the
/// caller persists `replica` once this returns, win or lose.
pub fn on_lease_propose_resp(replica: &mut Replica, resp: &LeaseProposeResp, local_server_id: Uuid) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: ketch_base::LOG_TARGET, "lease propose response for unknown epoch");
        return;
    };
    if epoch.ballot_number != resp.ballot_number {
        error!(target: ketch_base::LOG_TARGET, "lease propose response for unknown ballot");
        return;
    }
    if epoch.lease_phase != LeasePhase::Propose {
        info!(target: ketch_base::LOG_TARGET, "lease propose response in unexpected phase");
        return;
    }

    let mut count: u32 = 0;
    for member in epoch.quorum.iter_mut() {
        if !member_in_known_state(member.common.state) {
            error!(target: ketch_base::LOG_TARGET, member_id = %member.common.id, "lease propose response with epoch member in unexpected state");
            continue;
        }
        if !member.accepted {
            count += 1;
            continue;
        }
        if member.common.id == resp.common.src_id && resp.proposal_owner_id == Some(local_server_id) {
            if resp.epoch_state != State::Open && replica.common.state != State::Closed {
                replica.common.pending_state = Some(State::Closed);
            }
            member.accepted = false;
            count += 1;
        }
    }
    if count <= replica.quorum_group_size / 2 {
        return;
    }

    let epoch = replica.epochs.get_mut(&resp.common.epoch_id).expect("epoch present, checked above");
    epoch.lease_owner = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::{AcceptorState, Common as ResourceCommon, DataState, Epoch, EpochSpec, QuorumMember, QuorumMemberType};

    fn member(id: Uuid) -> QuorumMember {
        QuorumMember {
            common: ResourceCommon { id, state: State::Open, ..Default::default() },
            member_type: QuorumMemberType::Sync,
            data_state: DataState::InSync,
            accepted: false,
            lease_owned: false,
        }
    }

    fn replica_with_one_epoch(epoch_id: Uuid, members: Vec<Uuid>) -> Replica {
        let mut replica = Replica {
            common: ResourceCommon { id: Uuid::new_v4(), state: State::Open, ..Default::default() },
            member_type: QuorumMemberType::Sync,
            data_state: DataState::InSync,
            current_epoch_id: Some(epoch_id),
            prior_epoch_id: None,
            epochs: Default::default(),
            quorum_group_size: members.len() as u32,
            home_server_id: Uuid::new_v4(),
            master_server_id: None,
            db_config: ketch_model::DBSpec { username: String::new(), password: String::new(), port: 0, closed_port: 0 },
        };
        replica.epochs.insert(
            epoch_id,
            EpochSpec {
                common: ResourceCommon { id: epoch_id, state: State::Open, ..Default::default() },
                quorum: members.into_iter().map(member).collect(),
                ballot_sequence: 1,
                ballot_number: BallotNumber { sequence: 1, server_id: Uuid::new_v4() },
                lease_phase: LeasePhase::Prepare,
                lease_owner: false,
                lease_expire_uptime: 0,
            },
        );
        replica
    }

    #[test]
    fn prepare_reqs_skip_renewal_when_not_due() {
        let epoch_id = Uuid::new_v4();
        let mut replica = replica_with_one_epoch(epoch_id, vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()]);
        replica.epochs.get_mut(&epoch_id).unwrap().lease_expire_uptime = 100;
        replica.epochs.get_mut(&epoch_id).unwrap().lease_owner = true;
        let mut next_period = 60;

        let (have_lease, msgs) = send_lease_prepare_reqs(&mut replica, epoch_id, None, Uuid::new_v4(), 0, &mut next_period);
        assert!(have_lease);
        assert!(msgs.is_empty());
    }

    #[test]
    fn prepare_reqs_go_out_to_every_quorum_member() {
        let epoch_id = Uuid::new_v4();
        let members = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let mut replica = replica_with_one_epoch(epoch_id, members.clone());
        let mut next_period = 60;
        let server_id = Uuid::new_v4();

        let (have_lease, msgs) = send_lease_prepare_reqs(&mut replica, epoch_id, None, server_id, 0, &mut next_period);
        assert!(!have_lease);
        assert_eq!(msgs.len(), members.len());
        assert_eq!(next_period, RETRANSMIT_INTERVAL);
    }

    #[test]
    fn majority_prepare_acceptance_moves_to_propose() {
        let epoch_id = Uuid::new_v4();
        let members = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let mut replica = replica_with_one_epoch(epoch_id, members.clone());
        let server_id = Uuid::new_v4();
        let ballot = replica.epochs[&epoch_id].ballot_number;

        for member_id in &members[..2] {
            let resp = LeasePrepareResp {
                common: Common { dest_id: server_id, src_id: *member_id, replica_id: replica.common.id, epoch_id },
                ballot_number: ballot,
                highest_promised: ballot,
                proposal_owner_id: None,
                successor_mismatch: false,
            };
            let msgs = on_lease_prepare_resp(&mut replica, &resp, server_id, 0);
            if msgs.is_empty() {
                continue;
            }
            assert_eq!(msgs.len(), members.len());
        }
        assert_eq!(replica.epochs[&epoch_id].lease_phase, LeasePhase::Propose);
    }
}
