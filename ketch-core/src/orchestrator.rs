use tracing::error;
use uuid::Uuid;

use ketch_base::LOG_TARGET;
use ketch_lease::{send_lease_prepare_reqs, LEASE_PERIOD};
use ketch_model::{
    BallotNumber, Common as ResourceCommon, DBMgr, DBState, DataState, EpochSpec, LeasePhase,
    QuorumMember, Replica, Server, State,
};
use ketch_net::Msg;
use ketch_store::{ResourceHooks, ResourceMgr};

use crate::dbsupervisor::DbSupervisor;
use crate::epoch;

/// Drives every resident replica's per-tick state machine: membership
/// check, slave path, epoch close/create/setup/open, lease acquisition,
/// peer replication, prior-epoch disposal, and starting the local
/// database process. Mirrors the original service loop's `process()`.
pub struct Orchestrator {
    pub local_server_id: Uuid,
}

impl Orchestrator {
    pub fn tick<H: ResourceHooks<Server>>(
        &self,
        server_mgr: &mut ResourceMgr<Server, H>,
        replica_mgr: &mut ResourceMgr<Replica>,
        dbmgr_mgr: &mut ResourceMgr<DBMgr>,
        dbsup: &mut DbSupervisor,
        uptime: i64,
    ) -> (u16, Vec<Msg>) {
        let mut next_period = LEASE_PERIOD;
        let mut out_msgs = Vec::new();

        if let Err(e) = server_mgr.get() {
            error!(target: LOG_TARGET, err = ?e, "failed to refresh server list");
        }

        let replica_ids: Vec<Uuid> = match replica_mgr.get() {
            Ok(list) => list.into_iter().map(|r| r.common.id).collect(),
            Err(e) => {
                error!(target: LOG_TARGET, err = ?e, "failed to list replicas");
                Vec::new()
            }
        };

        for replica_id in replica_ids {
            let Some(mut replica) = replica_mgr.get_by_id(replica_id) else {
                continue;
            };
            self.process_replica(&mut replica, server_mgr, dbmgr_mgr, dbsup, uptime, &mut next_period, &mut out_msgs);
            let _ = replica_mgr.put(replica);
        }

        (next_period, out_msgs)
    }

    fn process_replica<H: ResourceHooks<Server>>(
        &self,
        replica: &mut Replica,
        server_mgr: &ResourceMgr<Server, H>,
        dbmgr_mgr: &mut ResourceMgr<DBMgr>,
        dbsup: &mut DbSupervisor,
        uptime: i64,
        next_period: &mut u16,
        out_msgs: &mut Vec<Msg>,
    ) {
        if !membership_still_valid(replica, server_mgr) {
            replica.common.pending_state = Some(State::Closed);
            replica.master_server_id = None;
        }

        if replica.master_server_id.is_some() {
            dbsup.run_replica_on_port(dbmgr_mgr, server_mgr, replica, DBState::Slave, replica.db_config.port);
            return;
        }

        if replica.current_epoch_id.is_some() && replica.common.pending_state == Some(State::Closed) {
            let epoch_id = replica.current_epoch_id.unwrap();
            if !self.epoch_transition_to_closed(replica, epoch_id, dbmgr_mgr, server_mgr, dbsup, uptime, next_period, out_msgs) {
                return;
            }
            replica.common.state = State::Closed;
            replica.common.pending_state = None;
            match replica.prior_epoch_id {
                None => replica.prior_epoch_id = replica.current_epoch_id,
                Some(_) => {
                    replica.epochs.remove(&epoch_id);
                }
            }
            replica.current_epoch_id = None;
        }

        if replica.current_epoch_id.is_none() {
            let new_epoch_id = Uuid::new_v4();
            replica.epochs.insert(
                new_epoch_id,
                EpochSpec {
                    common: ResourceCommon { id: new_epoch_id, state: State::Uninitialized, ..Default::default() },
                    quorum: snapshot_quorum(replica),
                    ballot_sequence: 0,
                    ballot_number: BallotNumber::default(),
                    lease_phase: LeasePhase::Prepare,
                    lease_owner: false,
                    lease_expire_uptime: 0,
                },
            );
            replica.current_epoch_id = Some(new_epoch_id);
        }
        let current_epoch_id = replica.current_epoch_id.unwrap();

        let (setup_done, mut setup_msgs) = epoch::send_epoch_setup_reqs(replica, current_epoch_id, self.local_server_id, next_period);
        out_msgs.append(&mut setup_msgs);
        if !setup_done {
            return;
        }

        let (replicated, mut replicate_msgs) = epoch::send_replica_create_reqs(replica, current_epoch_id, self.local_server_id, next_period);
        out_msgs.append(&mut replicate_msgs);
        if !replicated {
            return;
        }

        if let Some(prior_epoch_id) = replica.prior_epoch_id {
            let (have_lease, mut msgs) =
                send_lease_prepare_reqs(replica, prior_epoch_id, Some(current_epoch_id), self.local_server_id, uptime, next_period);
            out_msgs.append(&mut msgs);
            if !have_lease {
                return;
            }
            let (revoked, mut revoke_msgs) =
                epoch::send_epoch_revoke_reqs(replica, prior_epoch_id, current_epoch_id, self.local_server_id, next_period);
            out_msgs.append(&mut revoke_msgs);
            if !revoked {
                return;
            }
            replica.epochs.remove(&prior_epoch_id);
            replica.prior_epoch_id = None;
        }

        let (have_lease, mut lease_msgs) = send_lease_prepare_reqs(replica, current_epoch_id, None, self.local_server_id, uptime, next_period);
        out_msgs.append(&mut lease_msgs);
        if !have_lease {
            return;
        }

        let (open_done, mut open_msgs) = epoch::send_epoch_open_reqs(replica, current_epoch_id, self.local_server_id, next_period);
        out_msgs.append(&mut open_msgs);
        if !open_done {
            return;
        }

        dbsup.run_replica_on_port(dbmgr_mgr, server_mgr, replica, DBState::Master, replica.db_config.port);
    }

    #[allow(clippy::too_many_arguments)]
    fn epoch_transition_to_closed<H: ResourceHooks<Server>>(
        &self,
        replica: &mut Replica,
        epoch_id: Uuid,
        dbmgr_mgr: &mut ResourceMgr<DBMgr>,
        server_mgr: &ResourceMgr<Server, H>,
        dbsup: &mut DbSupervisor,
        uptime: i64,
        next_period: &mut u16,
        out_msgs: &mut Vec<Msg>,
    ) -> bool {
        let (setup_done, mut setup_msgs) = epoch::send_epoch_setup_reqs(replica, epoch_id, self.local_server_id, next_period);
        out_msgs.append(&mut setup_msgs);
        if !setup_done {
            return false;
        }
        let (have_lease, mut lease_msgs) = send_lease_prepare_reqs(replica, epoch_id, None, self.local_server_id, uptime, next_period);
        out_msgs.append(&mut lease_msgs);
        if !have_lease {
            return false;
        }
        let (closed, mut close_msgs) = epoch::send_epoch_close_reqs(replica, epoch_id, self.local_server_id, next_period);
        out_msgs.append(&mut close_msgs);
        if !closed {
            return false;
        }
        dbsup.run_replica_on_port(dbmgr_mgr, server_mgr, replica, DBState::MasterClosed, replica.db_config.closed_port)
    }
}

/// A replica's membership is only worth re-checking once it has a
/// current epoch: every quorum member of that epoch must still be
/// present in the Server table, or the replica is marked for closing
/// ahead of a new epoch being formed.
fn membership_still_valid<H: ResourceHooks<Server>>(replica: &Replica, server_mgr: &ResourceMgr<Server, H>) -> bool {
    let Some(epoch) = replica.current_epoch() else {
        return true;
    };
    epoch.quorum.iter().all(|member| server_mgr.get_by_id(member.common.id).is_some())
}

fn snapshot_quorum(replica: &Replica) -> Vec<QuorumMember> {
    if let Some(epoch) = replica.current_epoch() {
        return epoch
            .quorum
            .iter()
            .map(|m| QuorumMember {
                common: ResourceCommon { id: m.common.id, state: State::Uninitialized, ..Default::default() },
                member_type: m.member_type,
                data_state: DataState::CatchUp,
                accepted: false,
                lease_owned: false,
            })
            .collect();
    }
    vec![QuorumMember {
        common: ResourceCommon { id: replica.home_server_id, state: State::Uninitialized, ..Default::default() },
        member_type: ketch_model::QuorumMemberType::Sync,
        data_state: DataState::InSync,
        accepted: false,
        lease_owned: false,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ketch_model::{DBSpec, Endpoint, QuorumMemberType};
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    fn server(id: Uuid) -> Server {
        Server {
            common: ResourceCommon { id, state: State::Open, ..Default::default() },
            endpoint: Endpoint { addr: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 7459 },
        }
    }

    fn bare_replica(home_server_id: Uuid) -> Replica {
        Replica {
            common: ResourceCommon { id: Uuid::new_v4(), name: "r1".into(), state: State::New, ..Default::default() },
            member_type: QuorumMemberType::Sync,
            data_state: DataState::InSync,
            current_epoch_id: None,
            prior_epoch_id: None,
            epochs: Default::default(),
            quorum_group_size: 1,
            home_server_id,
            master_server_id: None,
            db_config: DBSpec { username: "ketch".into(), password: String::new(), port: 6000, closed_port: 6001 },
        }
    }

    fn replica_with_quorum(home_server_id: Uuid, quorum_ids: &[Uuid]) -> Replica {
        let mut replica = bare_replica(home_server_id);
        let epoch_id = Uuid::new_v4();
        replica.epochs.insert(
            epoch_id,
            EpochSpec {
                common: ResourceCommon { id: epoch_id, state: State::Open, ..Default::default() },
                quorum: quorum_ids
                    .iter()
                    .map(|id| QuorumMember {
                        common: ResourceCommon { id: *id, state: State::Open, ..Default::default() },
                        member_type: QuorumMemberType::Sync,
                        data_state: DataState::InSync,
                        accepted: false,
                        lease_owned: false,
                    })
                    .collect(),
                ballot_sequence: 0,
                ballot_number: BallotNumber::default(),
                lease_phase: LeasePhase::Prepare,
                lease_owner: false,
                lease_expire_uptime: 0,
            },
        );
        replica.current_epoch_id = Some(epoch_id);
        replica
    }

    #[test]
    fn membership_still_valid_with_no_current_epoch_is_a_no_op() {
        let server_mgr: ResourceMgr<Server> = ResourceMgr::new(ketch_model::ResourceType::Server, false, false, false, ketch_store::NoHooks, None).unwrap();
        let replica = bare_replica(Uuid::new_v4());
        assert!(membership_still_valid(&replica, &server_mgr));
    }

    #[test]
    fn membership_still_valid_checks_every_quorum_member() {
        let home_id = Uuid::new_v4();
        let master_id = Uuid::new_v4();
        let mut server_mgr: ResourceMgr<Server> = ResourceMgr::new(ketch_model::ResourceType::Server, false, false, false, ketch_store::NoHooks, None).unwrap();
        server_mgr.create(vec![server(home_id), server(master_id)]).unwrap();

        let present = replica_with_quorum(home_id, &[home_id, master_id]);
        assert!(membership_still_valid(&present, &server_mgr));

        // home_server_id itself is up, but the replica's actual master, a
        // different quorum member, has dropped out of membership.
        let master_down = replica_with_quorum(home_id, &[home_id, Uuid::new_v4()]);
        assert!(!membership_still_valid(&master_down, &server_mgr));
    }

    #[test]
    fn membership_loss_clears_master_server_id() {
        let home_id = Uuid::new_v4();
        let mut server_mgr: ResourceMgr<Server> = ResourceMgr::new(ketch_model::ResourceType::Server, false, false, false, ketch_store::NoHooks, None).unwrap();
        server_mgr.create(vec![server(home_id)]).unwrap();

        let missing_member = Uuid::new_v4();
        let mut replica = replica_with_quorum(home_id, &[home_id, missing_member]);
        replica.master_server_id = Some(missing_member);

        let orchestrator = Orchestrator { local_server_id: home_id };
        let mut dbmgr_mgr: ResourceMgr<DBMgr> =
            ResourceMgr::new(ketch_model::ResourceType::DBMgr, false, false, false, ketch_store::NoHooks, None).unwrap();
        let (mut dbsup, _rx) = DbSupervisor::new(crate::dbsupervisor::DbConfig { data_dir: PathBuf::from("."), db_bin_dir: PathBuf::from(".") });
        let mut next_period = ketch_lease::LEASE_PERIOD;
        let mut out_msgs = Vec::new();

        orchestrator.process_replica(&mut replica, &server_mgr, &mut dbmgr_mgr, &mut dbsup, 0, &mut next_period, &mut out_msgs);

        assert_eq!(replica.common.pending_state, Some(State::Closed));
        assert_eq!(replica.master_server_id, None);
    }

    #[test]
    fn snapshot_quorum_falls_back_to_home_server_when_no_current_epoch() {
        let home_id = Uuid::new_v4();
        let replica = bare_replica(home_id);
        let quorum = snapshot_quorum(&replica);
        assert_eq!(quorum.len(), 1);
        assert_eq!(quorum[0].common.id, home_id);
        assert_eq!(quorum[0].data_state, DataState::InSync);
    }

    #[test]
    fn tick_creates_an_epoch_for_a_replica_with_none_and_requests_setup() {
        let home_id = Uuid::new_v4();
        let mut server_mgr: ResourceMgr<Server> = ResourceMgr::new(ketch_model::ResourceType::Server, false, false, false, ketch_store::NoHooks, None).unwrap();
        server_mgr.create(vec![server(home_id)]).unwrap();

        let mut replica_mgr: ResourceMgr<Replica> =
            ResourceMgr::new(ketch_model::ResourceType::Replica, false, false, false, ketch_store::NoHooks, None).unwrap();
        replica_mgr.create(vec![bare_replica(home_id)]).unwrap();

        let mut dbmgr_mgr: ResourceMgr<DBMgr> =
            ResourceMgr::new(ketch_model::ResourceType::DBMgr, false, false, false, ketch_store::NoHooks, None).unwrap();

        let (mut dbsup, _rx) = DbSupervisor::new(crate::dbsupervisor::DbConfig { data_dir: PathBuf::from("."), db_bin_dir: PathBuf::from(".") });
        let orchestrator = Orchestrator { local_server_id: home_id };

        let (next_period, msgs) = orchestrator.tick(&mut server_mgr, &mut replica_mgr, &mut dbmgr_mgr, &mut dbsup, 0);

        assert_eq!(next_period, ketch_lease::RETRANSMIT_INTERVAL);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], Msg::EpochSetupReq(_)));

        let replica_id = replica_mgr.get().unwrap()[0].common.id;
        let updated = replica_mgr.get_by_id(replica_id).unwrap();
        assert!(updated.current_epoch_id.is_some());
    }
}
