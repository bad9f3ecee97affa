use tracing::error;
use uuid::Uuid;

use ketch_base::LOG_TARGET;
use ketch_model::{AcceptorState, Common as ResourceCommon, DataState, Epoch, QuorumMemberType, Replica, State};
use ketch_net::{
    Common, EpochCloseReq, EpochCloseResp, EpochOpenReq, EpochOpenResp, EpochRevokeReq,
    EpochRevokeResp, EpochSetupReq, EpochSetupResp, Msg, ReplicaCreateReq, ReplicaCreateResp,
};

use ketch_lease::RETRANSMIT_INTERVAL;

fn swap_common(req: &Common) -> Common {
    Common { dest_id: req.src_id, src_id: req.dest_id, replica_id: req.replica_id, epoch_id: req.epoch_id }
}

/// Proposer side of epoch setup: asks every quorum member still
/// `Uninitialized` to create the epoch resource. Returns true once every
/// member has reached at least `New`.
pub fn send_epoch_setup_reqs(replica: &Replica, epoch_id: Uuid, local_server_id: Uuid, next_period: &mut u16) -> (bool, Vec<Msg>) {
    let epoch = replica.epochs.get(&epoch_id).unwrap_or_else(|| ketch_base::fatal(format!("send epoch setup requests for unknown epoch {epoch_id}")));

    let mut msgs = Vec::new();
    let mut count = 0u32;
    for member in &epoch.quorum {
        match member.common.state {
            State::Uninitialized => {
                msgs.push(Msg::EpochSetupReq(EpochSetupReq {
                    common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id: replica.common.id, epoch_id },
                }));
                if *next_period > RETRANSMIT_INTERVAL {
                    *next_period = RETRANSMIT_INTERVAL;
                }
            }
            State::New | State::Open | State::Closed => count += 1,
            other => error!(target: LOG_TARGET, member_id = %member.common.id, state = ?other, "send epoch setup request for member in unexpected state"),
        }
    }
    (count == replica.quorum_group_size, msgs)
}

/// Acceptor side: builds the epoch resource to create and the response to
/// send for an incoming setup request.
pub fn on_epoch_setup_req(req: &EpochSetupReq) -> (Epoch, EpochSetupResp) {
    let epoch = Epoch {
        common: ResourceCommon { id: req.common.epoch_id, state: State::New, ..Default::default() },
        replica_id: req.common.replica_id,
        successor_epoch_id: None,
        acceptor: AcceptorState::default(),
    };
    let resp = EpochSetupResp { common: swap_common(&req.common) };
    (epoch, resp)
}

pub fn on_epoch_setup_resp(replica: &mut Replica, resp: &EpochSetupResp) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: LOG_TARGET, "epoch setup response for unknown epoch");
        return;
    };
    for member in epoch.quorum.iter_mut() {
        if member.common.id == resp.common.src_id {
            member.common.state = State::New;
            break;
        }
    }
}

/// Replicates `replica` out to every quorum member that needs it: skips
/// the local server, witnesses, and members already in sync. Returns
/// true only once no member needs a request at all — a member that was
/// just sent one still counts as outstanding until its
/// `ReplicaCreateResp` marks it in sync.
pub fn send_replica_create_reqs(replica: &Replica, epoch_id: Uuid, local_server_id: Uuid, next_period: &mut u16) -> (bool, Vec<Msg>) {
    let epoch = replica.epochs.get(&epoch_id).unwrap_or_else(|| ketch_base::fatal(format!("send replica create requests for unknown epoch {epoch_id}")));

    let mut msgs = Vec::new();
    let mut count = 0u32;
    for member in &epoch.quorum {
        if member.common.id == local_server_id || member.member_type == QuorumMemberType::Witness || member.data_state == DataState::InSync {
            count += 1;
            continue;
        }
        msgs.push(Msg::ReplicaCreateReq(ReplicaCreateReq {
            common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id: replica.common.id, epoch_id },
            replica: replica.clone(),
        }));
        if *next_period > RETRANSMIT_INTERVAL {
            *next_period = RETRANSMIT_INTERVAL;
        }
    }
    (count == replica.quorum_group_size, msgs)
}

pub fn on_replica_create_resp(replica: &mut Replica, resp: &ReplicaCreateResp) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: LOG_TARGET, "replica create response for unknown epoch");
        return;
    };
    for member in epoch.quorum.iter_mut() {
        if member.common.id == resp.common.src_id {
            member.data_state = DataState::InSync;
            return;
        }
    }
    error!(target: LOG_TARGET, src_id = %resp.common.src_id, "replica create response from unknown quorum member");
}

/// Proposer side of epoch open. Returns true once every member is `Open`.
pub fn send_epoch_open_reqs(replica: &Replica, epoch_id: Uuid, local_server_id: Uuid, next_period: &mut u16) -> (bool, Vec<Msg>) {
    let epoch = replica.epochs.get(&epoch_id).unwrap_or_else(|| ketch_base::fatal(format!("send epoch open requests for unknown epoch {epoch_id}")));

    let mut msgs = Vec::new();
    let mut count = 0u32;
    for member in &epoch.quorum {
        match member.common.state {
            State::New | State::Closed => {
                msgs.push(Msg::EpochOpenReq(EpochOpenReq {
                    common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id: replica.common.id, epoch_id },
                }));
                if *next_period > RETRANSMIT_INTERVAL {
                    *next_period = RETRANSMIT_INTERVAL;
                }
            }
            State::Open => count += 1,
            other => error!(target: LOG_TARGET, member_id = %member.common.id, state = ?other, "send epoch open request for member in unexpected state"),
        }
    }
    (count == replica.quorum_group_size, msgs)
}

/// Acceptor side: opens `epoch` in place. Returns `None` when the epoch
/// is in a state that forbids opening at all.
pub fn on_epoch_open_req(epoch: &mut Epoch, req: &EpochOpenReq) -> Option<EpochOpenResp> {
    match epoch.common.state {
        State::New | State::Closed => epoch.common.state = State::Open,
        State::Open => {}
        other => {
            error!(target: LOG_TARGET, state = ?other, "epoch open request for epoch in unexpected state");
            return None;
        }
    }
    Some(EpochOpenResp { common: swap_common(&req.common) })
}

/// Other epochs for the same replica that an opened epoch supersedes and
/// that should be dropped from the acceptor's epoch store.
pub fn superseded_epoch_ids(epochs: &[Epoch], opened_epoch_id: Uuid, replica_id: Uuid) -> Vec<Uuid> {
    epochs
        .iter()
        .filter(|e| e.common.id != opened_epoch_id && e.replica_id == replica_id)
        .map(|e| e.common.id)
        .collect()
}

pub fn on_epoch_open_resp(replica: &mut Replica, resp: &EpochOpenResp) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: LOG_TARGET, "epoch open response for unknown epoch");
        return;
    };
    for member in epoch.quorum.iter_mut() {
        if member.common.id == resp.common.src_id {
            member.common.state = State::Open;
            break;
        }
    }
}

/// Proposer side of epoch close. Returns true once at least a majority
/// of members are `Closed`.
pub fn send_epoch_close_reqs(replica: &Replica, epoch_id: Uuid, local_server_id: Uuid, next_period: &mut u16) -> (bool, Vec<Msg>) {
    let epoch = replica.epochs.get(&epoch_id).unwrap_or_else(|| ketch_base::fatal(format!("send epoch close requests for unknown epoch {epoch_id}")));

    let mut msgs = Vec::new();
    let mut count = 0u32;
    for member in &epoch.quorum {
        match member.common.state {
            State::New | State::Open => {
                msgs.push(Msg::EpochCloseReq(EpochCloseReq {
                    common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id: replica.common.id, epoch_id },
                }));
                if *next_period > RETRANSMIT_INTERVAL {
                    *next_period = RETRANSMIT_INTERVAL;
                }
            }
            State::Closed => count += 1,
            other => error!(target: LOG_TARGET, member_id = %member.common.id, state = ?other, "send epoch close request for member in unexpected state"),
        }
    }
    (count >= replica.quorum_group_size / 2, msgs)
}

pub fn on_epoch_close_req(epoch: &mut Epoch, req: &EpochCloseReq) -> EpochCloseResp {
    match epoch.common.state {
        State::New | State::Open | State::Closed => {}
        other => error!(target: LOG_TARGET, state = ?other, "epoch close request for epoch in unexpected state"),
    }
    epoch.common.state = State::Closed;
    epoch.common.pending_state = None;
    EpochCloseResp { common: swap_common(&req.common) }
}

pub fn on_epoch_close_resp(replica: &mut Replica, resp: &EpochCloseResp) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: LOG_TARGET, "epoch close response for unknown epoch");
        return;
    };
    for member in epoch.quorum.iter_mut() {
        if member.common.id == resp.common.src_id {
            member.common.state = State::Closed;
            member.common.pending_state = None;
            break;
        }
    }
}

/// Proposer side of epoch revocation. Returns true once a strict
/// majority of members have the pending-delete mark.
pub fn send_epoch_revoke_reqs(
    replica: &Replica,
    epoch_id: Uuid,
    successor_epoch_id: Uuid,
    local_server_id: Uuid,
    next_period: &mut u16,
) -> (bool, Vec<Msg>) {
    let epoch = replica.epochs.get(&epoch_id).unwrap_or_else(|| ketch_base::fatal(format!("send epoch revoke requests for unknown epoch {epoch_id}")));

    let mut msgs = Vec::new();
    let mut count = 0u32;
    for member in &epoch.quorum {
        match member.common.state {
            State::New | State::Open | State::Closed => {
                if member.common.pending_state == Some(State::Delete) {
                    count += 1;
                } else {
                    msgs.push(Msg::EpochRevokeReq(EpochRevokeReq {
                        common: Common { dest_id: member.common.id, src_id: local_server_id, replica_id: replica.common.id, epoch_id },
                        successor_epoch_id,
                    }));
                    if *next_period > RETRANSMIT_INTERVAL {
                        *next_period = RETRANSMIT_INTERVAL;
                    }
                }
            }
            other => error!(target: LOG_TARGET, member_id = %member.common.id, state = ?other, "send epoch revoke request for member in unexpected state"),
        }
    }
    (count > replica.quorum_group_size / 2, msgs)
}

pub fn on_epoch_revoke_req(epoch: &mut Epoch, req: &EpochRevokeReq) -> EpochRevokeResp {
    if epoch.common.state != State::Closed {
        error!(target: LOG_TARGET, state = ?epoch.common.state, "epoch revoke request for epoch in unexpected state");
    }
    epoch.common.pending_state = Some(State::Delete);
    epoch.successor_epoch_id = Some(req.successor_epoch_id);
    EpochRevokeResp { common: swap_common(&req.common) }
}

pub fn on_epoch_revoke_resp(replica: &mut Replica, resp: &EpochRevokeResp) {
    let Some(epoch) = replica.epochs.get_mut(&resp.common.epoch_id) else {
        error!(target: LOG_TARGET, "epoch revoke response for unknown epoch");
        return;
    };
    for member in epoch.quorum.iter_mut() {
        if member.common.id == resp.common.src_id {
            member.common.pending_state = Some(State::Delete);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::{BallotNumber, DBSpec, DataState, EpochSpec, LeasePhase, QuorumMember, QuorumMemberType};

    fn member(id: Uuid, state: State) -> QuorumMember {
        QuorumMember {
            common: ResourceCommon { id, state, ..Default::default() },
            member_type: QuorumMemberType::Sync,
            data_state: DataState::InSync,
            accepted: false,
            lease_owned: false,
        }
    }

    fn replica_with_epoch(epoch_id: Uuid, members: Vec<QuorumMember>) -> Replica {
        let mut replica = Replica {
            common: ResourceCommon { id: Uuid::new_v4(), state: State::New, ..Default::default() },
            member_type: QuorumMemberType::Sync,
            data_state: DataState::InSync,
            current_epoch_id: Some(epoch_id),
            prior_epoch_id: None,
            epochs: Default::default(),
            quorum_group_size: members.len() as u32,
            home_server_id: Uuid::new_v4(),
            master_server_id: None,
            db_config: DBSpec { username: String::new(), password: String::new(), port: 0, closed_port: 0 },
        };
        replica.epochs.insert(
            epoch_id,
            EpochSpec {
                common: ResourceCommon { id: epoch_id, state: State::New, ..Default::default() },
                quorum: members,
                ballot_sequence: 0,
                ballot_number: BallotNumber::default(),
                lease_phase: LeasePhase::Prepare,
                lease_owner: false,
                lease_expire_uptime: 0,
            },
        );
        replica
    }

    #[test]
    fn setup_reqs_target_only_uninitialized_members() {
        let epoch_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let replica = replica_with_epoch(epoch_id, vec![member(a, State::Uninitialized), member(b, State::New)]);
        let mut next_period = 60;

        let (all_done, msgs) = send_epoch_setup_reqs(&replica, epoch_id, Uuid::new_v4(), &mut next_period);
        assert!(!all_done);
        assert_eq!(msgs.len(), 1);
        assert_eq!(next_period, RETRANSMIT_INTERVAL);
    }

    #[test]
    fn replica_create_reqs_skip_local_witness_and_in_sync_members() {
        let epoch_id = Uuid::new_v4();
        let local = Uuid::new_v4();
        let witness = QuorumMember { member_type: QuorumMemberType::Witness, ..member(Uuid::new_v4(), State::Open) };
        let in_sync = member(Uuid::new_v4(), State::Open);
        let behind = QuorumMember { data_state: DataState::CatchUp, ..member(Uuid::new_v4(), State::Open) };
        let behind_id = behind.common.id;
        let replica = replica_with_epoch(epoch_id, vec![member(local, State::Open), witness, in_sync, behind]);
        let mut next_period = 60;

        let (all_sent, msgs) = send_replica_create_reqs(&replica, epoch_id, local, &mut next_period);
        assert!(all_sent);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].common().dest_id, behind_id);
        assert_eq!(next_period, RETRANSMIT_INTERVAL);
    }

    #[test]
    fn replica_create_resp_marks_member_in_sync() {
        let epoch_id = Uuid::new_v4();
        let member_id = Uuid::new_v4();
        let behind = QuorumMember { data_state: DataState::CatchUp, ..member(member_id, State::Open) };
        let mut replica = replica_with_epoch(epoch_id, vec![behind]);
        let resp = ReplicaCreateResp {
            common: Common { dest_id: Uuid::new_v4(), src_id: member_id, replica_id: replica.common.id, epoch_id },
        };

        on_replica_create_resp(&mut replica, &resp);
        assert_eq!(replica.epochs[&epoch_id].quorum[0].data_state, DataState::InSync);
    }

    #[test]
    fn open_req_moves_new_epoch_to_open() {
        let mut epoch = Epoch {
            common: ResourceCommon { id: Uuid::new_v4(), state: State::New, ..Default::default() },
            replica_id: Uuid::new_v4(),
            successor_epoch_id: None,
            acceptor: AcceptorState::default(),
        };
        let req = EpochOpenReq {
            common: Common { dest_id: epoch.common.id, src_id: Uuid::new_v4(), replica_id: epoch.replica_id, epoch_id: epoch.common.id },
        };
        on_epoch_open_req(&mut epoch, &req);
        assert_eq!(epoch.common.state, State::Open);
    }

    #[test]
    fn revoke_req_marks_pending_delete_with_successor() {
        let mut epoch = Epoch {
            common: ResourceCommon { id: Uuid::new_v4(), state: State::Closed, ..Default::default() },
            replica_id: Uuid::new_v4(),
            successor_epoch_id: None,
            acceptor: AcceptorState::default(),
        };
        let successor = Uuid::new_v4();
        let req = EpochRevokeReq {
            common: Common { dest_id: epoch.common.id, src_id: Uuid::new_v4(), replica_id: epoch.replica_id, epoch_id: epoch.common.id },
            successor_epoch_id: successor,
        };
        on_epoch_revoke_req(&mut epoch, &req);
        assert_eq!(epoch.common.pending_state, Some(State::Delete));
        assert_eq!(epoch.successor_epoch_id, Some(successor));
    }
}
