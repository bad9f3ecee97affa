use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::error;
use uuid::Uuid;

use ketch_base::{fatal, Clock, LOG_TARGET, Result};
use ketch_model::{
    Common as ResourceCommon, DBMgr, Endpoint, Epoch, Replica, ResourceType, Runtime, Server,
    State,
};
use ketch_net::{Membership, Msg, Transport};
use ketch_store::{CreateError, NoHooks, Persistence, ResourceHooks, ResourceMgr};

use crate::dbsupervisor::{DbConfig, DbExited, DbSupervisor};
use crate::epoch;
use crate::orchestrator::Orchestrator;

/// Derives the Server table from the membership snapshot on every
/// refresh, never persisting it.
struct ServerHooks {
    membership: Arc<Membership>,
}

impl ResourceHooks<Server> for ServerHooks {
    fn refresh_list(&self) -> Option<Vec<Server>> {
        Some(
            self.membership
                .snapshot()
                .into_iter()
                .map(|info| Server {
                    common: ResourceCommon { name: info.name, id: info.id, state: State::Open, pending_state: None },
                    endpoint: info.endpoint,
                })
                .collect(),
        )
    }
}

/// Reconciles the persisted Runtime record with this process's actual
/// endpoint and boot time, discarding stale values from a prior
/// incarnation without losing the stable `id`.
struct RuntimeHooks {
    name: String,
    endpoint: Endpoint,
    boot_time: SystemTime,
}

impl ResourceHooks<Runtime> for RuntimeHooks {
    fn update_after_load(&self, resource: &mut Runtime) -> bool {
        if resource.common.name != self.name || resource.endpoint != self.endpoint || resource.boot_time != self.boot_time {
            resource.common.name = self.name.clone();
            resource.endpoint = self.endpoint;
            resource.boot_time = self.boot_time;
            true
        } else {
            false
        }
    }
}

struct Inner {
    runtime_mgr: ResourceMgr<Runtime, RuntimeHooks>,
    server_mgr: ResourceMgr<Server, ServerHooks>,
    epoch_mgr: ResourceMgr<Epoch>,
    replica_mgr: ResourceMgr<Replica>,
    dbmgr_mgr: ResourceMgr<DBMgr>,
    dbsup: DbSupervisor,
    db_exited: Receiver<DbExited>,
    orchestrator: Orchestrator,
    local_server_id: Uuid,
}

/// Owns every piece of durable and derived state for one node: the five
/// resource tables, the database supervisor, and the replica
/// orchestrator, all behind the one lock the concurrency model requires.
/// The dispatcher and service-tick threads, and every management API
/// call, go through this type and nothing else.
pub struct Service {
    inner: Mutex<Inner>,
    transport: Transport,
    clock: Box<dyn Clock>,
}

impl Service {
    pub fn new(
        name: String,
        endpoint: Endpoint,
        db_config: DbConfig,
        persistence: Arc<Persistence>,
        membership: Arc<Membership>,
        transport: Transport,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let boot_time = clock.boot_time();
        let mut runtime_mgr: ResourceMgr<Runtime, RuntimeHooks> = ResourceMgr::new(
            ResourceType::Runtime,
            false,
            false,
            true,
            RuntimeHooks { name: name.clone(), endpoint, boot_time },
            Some(persistence.clone()),
        )?;
        let existing = runtime_mgr.get()?;
        let local_server_id = match existing.into_iter().next() {
            Some(runtime) => runtime.common.id,
            None => {
                let runtime = Runtime {
                    common: ResourceCommon { name, id: Uuid::new_v4(), state: State::Open, pending_state: None },
                    endpoint,
                    boot_time,
                };
                let created = runtime_mgr.create(vec![runtime]).map_err(|e| ketch_base::err(e.to_string()))?;
                created[0].common.id
            }
        };

        let server_mgr: ResourceMgr<Server, ServerHooks> =
            ResourceMgr::new(ResourceType::Server, false, false, false, ServerHooks { membership }, None)?;
        let epoch_mgr: ResourceMgr<Epoch> =
            ResourceMgr::new(ResourceType::Epoch, false, false, true, NoHooks, Some(persistence.clone()))?;
        let replica_mgr: ResourceMgr<Replica> =
            ResourceMgr::new(ResourceType::Replica, true, true, true, NoHooks, Some(persistence))?;
        let dbmgr_mgr: ResourceMgr<DBMgr> = ResourceMgr::new(ResourceType::DBMgr, false, false, false, NoHooks, None)?;

        let (dbsup, db_exited) = DbSupervisor::new(db_config);

        Ok(Service {
            inner: Mutex::new(Inner {
                runtime_mgr,
                server_mgr,
                epoch_mgr,
                replica_mgr,
                dbmgr_mgr,
                dbsup,
                db_exited,
                orchestrator: Orchestrator { local_server_id },
                local_server_id,
            }),
            transport,
            clock,
        })
    }

    /// Drives every resident replica forward one step, reaps any exited
    /// database processes, and sends whatever outbound messages result.
    /// Returns the number of seconds to sleep before the next tick.
    pub fn tick(&self) -> u16 {
        let (next_period, routed) = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let uptime = self.clock.uptime();
            let (next_period, msgs) = inner.orchestrator.tick(
                &mut inner.server_mgr,
                &mut inner.replica_mgr,
                &mut inner.dbmgr_mgr,
                &mut inner.dbsup,
                uptime,
            );
            let (dbmgr_mgr, db_exited, dbsup) = (&mut inner.dbmgr_mgr, &inner.db_exited, &mut inner.dbsup);
            dbsup.reap(dbmgr_mgr, db_exited);
            let routed = route_all(&inner.server_mgr, msgs);
            (next_period, routed)
        };
        self.send_all(routed);
        next_period
    }

    /// Decodes and applies one inbound protocol message, sending any
    /// response or follow-on messages it produces.
    pub fn dispatch(&self, msg: Msg) {
        let routed = {
            let mut inner = self.inner.lock().unwrap();
            let uptime = self.clock.uptime();
            dispatch_msg(&mut inner, msg, uptime)
        };
        self.send_all(routed);
    }

    /// Sends SIGINT to every managed database process. Called from the
    /// signal handler ahead of process exit.
    pub fn shutdown_databases(&self) {
        self.inner.lock().unwrap().dbsup.signal_shutdown();
    }

    pub fn list_runtime(&self) -> Result<Vec<Runtime>> {
        self.inner.lock().unwrap().runtime_mgr.get()
    }

    pub fn list_server(&self) -> Result<Vec<Server>> {
        self.inner.lock().unwrap().server_mgr.get()
    }

    pub fn list_epoch(&self) -> Result<Vec<Epoch>> {
        self.inner.lock().unwrap().epoch_mgr.get()
    }

    pub fn list_replica(&self) -> Result<Vec<Replica>> {
        self.inner.lock().unwrap().replica_mgr.get()
    }

    pub fn create_replica(&self, list: Vec<Replica>) -> std::result::Result<Vec<Replica>, CreateError> {
        let mut inner = self.inner.lock().unwrap();
        let home_server_id = inner.local_server_id;
        let mut list = list;
        for replica in list.iter_mut() {
            if replica.home_server_id == Uuid::nil() {
                replica.home_server_id = home_server_id;
            }
        }
        inner.replica_mgr.create(list)
    }

    pub fn list_dbmgr(&self) -> Result<Vec<DBMgr>> {
        self.inner.lock().unwrap().dbmgr_mgr.get()
    }

    fn send_all(&self, routed: Vec<(Endpoint, Msg)>) {
        for (endpoint, msg) in routed {
            if let Err(e) = self.transport.send(endpoint, &msg) {
                error!(target: LOG_TARGET, err = ?e, "failed to send outbound message");
            }
        }
    }
}

fn route_all(server_mgr: &ResourceMgr<Server, ServerHooks>, msgs: Vec<Msg>) -> Vec<(Endpoint, Msg)> {
    msgs.into_iter()
        .filter_map(|msg| {
            let dest_id = msg.common().dest_id;
            match server_mgr.get_by_id(dest_id) {
                Some(server) => Some((server.endpoint, msg)),
                None => {
                    error!(target: LOG_TARGET, dest_id = %dest_id, "dropping outbound message to unknown peer");
                    None
                }
            }
        })
        .collect()
}

fn dispatch_msg(inner: &mut Inner, msg: Msg, uptime: i64) -> Vec<(Endpoint, Msg)> {
    let local_server_id = inner.local_server_id;
    let msgs = match msg {
        Msg::EpochSetupReq(req) => {
            let (created, resp) = epoch::on_epoch_setup_req(&req);
            if let Err(e) = inner.epoch_mgr.put(created) {
                fatal(format!("failed to persist epoch: {e}"));
            }
            vec![Msg::EpochSetupResp(resp)]
        }
        Msg::EpochSetupResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| epoch::on_epoch_setup_resp(replica, &resp));
            Vec::new()
        }
        Msg::EpochOpenReq(req) => match inner.epoch_mgr.get_by_id(req.common.epoch_id) {
            Some(mut existing) => match epoch::on_epoch_open_req(&mut existing, &req) {
                Some(resp) => {
                    let opened_id = existing.common.id;
                    let replica_id = existing.replica_id;
                    if let Err(e) = inner.epoch_mgr.put(existing) {
                        fatal(format!("failed to persist epoch: {e}"));
                    }
                    if let Ok(all) = inner.epoch_mgr.get() {
                        for stale_id in epoch::superseded_epoch_ids(&all, opened_id, replica_id) {
                            if let Err(e) = inner.epoch_mgr.remove(stale_id) {
                                fatal(format!("failed to remove superseded epoch: {e}"));
                            }
                        }
                    }
                    vec![Msg::EpochOpenResp(resp)]
                }
                None => Vec::new(),
            },
            None => {
                error!(target: LOG_TARGET, "epoch open request for unknown epoch");
                Vec::new()
            }
        },
        Msg::EpochOpenResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| epoch::on_epoch_open_resp(replica, &resp));
            Vec::new()
        }
        Msg::EpochCloseReq(req) => match inner.epoch_mgr.get_by_id(req.common.epoch_id) {
            Some(mut existing) => {
                let resp = epoch::on_epoch_close_req(&mut existing, &req);
                if let Err(e) = inner.epoch_mgr.put(existing) {
                    fatal(format!("failed to persist epoch: {e}"));
                }
                vec![Msg::EpochCloseResp(resp)]
            }
            None => {
                error!(target: LOG_TARGET, "epoch close request for unknown epoch");
                Vec::new()
            }
        },
        Msg::EpochCloseResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| epoch::on_epoch_close_resp(replica, &resp));
            Vec::new()
        }
        Msg::EpochRevokeReq(req) => match inner.epoch_mgr.get_by_id(req.common.epoch_id) {
            Some(mut existing) => {
                let resp = epoch::on_epoch_revoke_req(&mut existing, &req);
                if let Err(e) = inner.epoch_mgr.put(existing) {
                    fatal(format!("failed to persist epoch: {e}"));
                }
                vec![Msg::EpochRevokeResp(resp)]
            }
            None => {
                error!(target: LOG_TARGET, "epoch revoke request for unknown epoch");
                Vec::new()
            }
        },
        Msg::EpochRevokeResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| epoch::on_epoch_revoke_resp(replica, &resp));
            Vec::new()
        }
        Msg::LeasePrepareReq(req) => match inner.epoch_mgr.get_by_id(req.common.epoch_id) {
            Some(mut existing) => {
                let (resp, mutated) = ketch_lease::on_lease_prepare_req(&mut existing, &req, uptime);
                if mutated {
                    if let Err(e) = inner.epoch_mgr.put(existing) {
                        fatal(format!("failed to persist epoch: {e}"));
                    }
                }
                vec![Msg::LeasePrepareResp(resp)]
            }
            None => {
                error!(target: LOG_TARGET, "lease prepare request for unknown epoch");
                Vec::new()
            }
        },
        Msg::LeasePrepareResp(resp) => {
            let replica_id = resp.common.replica_id;
            match inner.replica_mgr.get_by_id(replica_id) {
                Some(mut replica) => {
                    let msgs = ketch_lease::on_lease_prepare_resp(&mut replica, &resp, local_server_id, uptime);
                    if let Err(e) = inner.replica_mgr.put(replica) {
                        fatal(format!("failed to persist replica: {e}"));
                    }
                    msgs
                }
                None => Vec::new(),
            }
        }
        Msg::LeaseProposeReq(req) => match inner.epoch_mgr.get_by_id(req.common.epoch_id) {
            Some(mut existing) => match ketch_lease::on_lease_propose_req(&mut existing, &req, uptime) {
                Some((resp, mutated)) => {
                    if mutated {
                        if let Err(e) = inner.epoch_mgr.put(existing) {
                            fatal(format!("failed to persist epoch: {e}"));
                        }
                    }
                    vec![Msg::LeaseProposeResp(resp)]
                }
                None => Vec::new(),
            },
            None => {
                error!(target: LOG_TARGET, "lease propose request for unknown epoch");
                Vec::new()
            }
        },
        Msg::LeaseProposeResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| {
                ketch_lease::on_lease_propose_resp(replica, &resp, local_server_id)
            });
            Vec::new()
        }
        Msg::ReplicaCreateReq(req) => {
            let ketch_net::ReplicaCreateReq { common, replica } = req;
            if let Err(e) = inner.replica_mgr.put(replica) {
                fatal(format!("failed to persist replica: {e}"));
            }
            vec![Msg::ReplicaCreateResp(ketch_net::ReplicaCreateResp {
                common: ketch_net::Common {
                    dest_id: common.src_id,
                    src_id: common.dest_id,
                    replica_id: common.replica_id,
                    epoch_id: common.epoch_id,
                },
            })]
        }
        Msg::ReplicaCreateResp(resp) => {
            apply_to_replica(inner, resp.common.replica_id, |replica| epoch::on_replica_create_resp(replica, &resp));
            Vec::new()
        }
    };
    route_all(&inner.server_mgr, msgs)
}

fn apply_to_replica<F: FnOnce(&mut Replica)>(inner: &mut Inner, replica_id: Uuid, f: F) {
    let Some(mut replica) = inner.replica_mgr.get_by_id(replica_id) else {
        error!(target: LOG_TARGET, replica_id = %replica_id, "message for unknown replica");
        return;
    };
    f(&mut replica);
    if let Err(e) = inner.replica_mgr.put(replica) {
        fatal(format!("failed to persist replica: {e}"));
    }
}
