use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use tracing::{error, info};
use uuid::Uuid;

use ketch_base::LOG_TARGET;
use ketch_model::{Common as ResourceCommon, DBMgr, DBState, Replica, Server, State};
use ketch_store::{ResourceHooks, ResourceMgr};

/// Configuration the supervisor needs to lay out and launch database
/// instances: where replica data directories live and where the
/// `initdb`/`pg_basebackup`/`pg_rewind`/`postgres` binaries are found.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub data_dir: PathBuf,
    pub db_bin_dir: PathBuf,
}

/// Reported by a wait thread once a managed child process exits. Drained
/// by the service loop under its single lock so the state transition
/// happens at the same serialization point as everything else.
pub struct DbExited {
    pub dbmgr_id: Uuid,
    pub command: &'static str,
    pub next_state: State,
    pub ok: bool,
}

/// Spawns and tracks the external database processes backing each
/// resident replica. One instance per `ketchd` process.
pub struct DbSupervisor {
    config: DbConfig,
    pids: HashMap<Uuid, u32>,
    exited_tx: SyncSender<DbExited>,
}

impl DbSupervisor {
    pub fn new(config: DbConfig) -> (Self, Receiver<DbExited>) {
        let (tx, rx) = sync_channel(16);
        (DbSupervisor { config, pids: HashMap::new(), exited_tx: tx }, rx)
    }

    /// Applies any exited-process notifications queued since the last
    /// call, advancing each affected `DBMgr`'s state.
    pub fn reap(&mut self, dbmgr_mgr: &mut ResourceMgr<DBMgr>, exited: &Receiver<DbExited>) {
        while let Ok(event) = exited.try_recv() {
            self.pids.remove(&event.dbmgr_id);
            let Some(mut dbmgr) = dbmgr_mgr.get_by_id(event.dbmgr_id) else {
                continue;
            };
            dbmgr.common.pending_state = None;
            if event.ok {
                info!(target: LOG_TARGET, cmd = event.command, "completed");
                dbmgr.common.state = event.next_state;
            } else {
                error!(target: LOG_TARGET, cmd = event.command, "command exited with error");
            }
            let _ = dbmgr_mgr.put(dbmgr);
        }
    }

    /// Sends SIGINT to every running database process, for a clean
    /// shutdown ahead of process exit.
    pub fn signal_shutdown(&mut self) {
        for (id, pid) in self.pids.iter() {
            info!(target: LOG_TARGET, dbmgr_id = %id, pid, "sending shutdown signal");
            send_sigint(*pid);
        }
    }

    fn spawn(&mut self, dbmgr_id: Uuid, next_state: State, command: &'static str, args: Vec<String>, env: Vec<(String, String)>) {
        let bin = self.config.db_bin_dir.join(command);
        info!(target: LOG_TARGET, cmd = command, ?args, "start");
        let mut cmd = Command::new(&bin);
        cmd.args(&args).envs(env).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(target: LOG_TARGET, cmd = command, err = %e, "failed to start command");
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, command, false);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, command, true);
        }

        self.pids.insert(dbmgr_id, child.id());

        let tx = self.exited_tx.clone();
        thread::spawn(move || {
            let ok = child.wait().map(|status| status.success()).unwrap_or(false);
            let _ = tx.send(DbExited { dbmgr_id, command, next_state, ok });
        });
    }

    /// Drives one replica's database process toward `db_state` on
    /// `port`, advancing the init/base-backup/rewind -> create-db ->
    /// configure -> start pipeline one step per call. Returns true once
    /// the database is accepting connections on `port`.
    pub fn run_replica_on_port<H: ResourceHooks<Server>>(
        &mut self,
        dbmgr_mgr: &mut ResourceMgr<DBMgr>,
        server_mgr: &ResourceMgr<Server, H>,
        replica: &Replica,
        db_state: DBState,
        port: u16,
    ) -> bool {
        let mut dbmgr = dbmgr_mgr.get_by_id(replica.common.id).unwrap_or_else(|| DBMgr {
            common: ResourceCommon { id: replica.common.id, name: replica.common.name.clone(), state: State::Uninitialized, pending_state: None },
            db_state,
            db_dir: self.config.data_dir.join(replica.common.id.to_string()).to_string_lossy().into_owned(),
            port,
        });

        if dbmgr.common.state == State::Open {
            if dbmgr.port == port {
                let _ = dbmgr_mgr.put(dbmgr);
                return true;
            }
            if let Some(pid) = self.pids.get(&replica.common.id) {
                send_sigint(*pid);
            } else {
                error!(target: LOG_TARGET, replica_id = %replica.common.id, "database manager open without a tracked process");
            }
            let _ = dbmgr_mgr.put(dbmgr);
            return false;
        }

        let master_addr = match replica.master_server_id {
            Some(master_id) => match server_mgr.get_by_id(master_id) {
                Some(server) => Some(server.endpoint.addr.to_string()),
                None => {
                    info!(target: LOG_TARGET, replica_id = %replica.common.id, "attempt to start slave for unknown master");
                    let _ = dbmgr_mgr.put(dbmgr);
                    return false;
                }
            },
            None => None,
        };

        let data_dir = PathBuf::from(&dbmgr.db_dir);
        let is_slave = db_state == DBState::Slave;

        let result = match dbmgr.common.state {
            State::Uninitialized => {
                if dbmgr.common.pending_state.is_some() {
                    let _ = dbmgr_mgr.put(dbmgr);
                    return false;
                }
                let already_initialized = data_dir.join("PG_VERSION").is_file();
                if !already_initialized {
                    if let Err(e) = std::fs::create_dir_all(&data_dir) {
                        error!(target: LOG_TARGET, err = %e, "failed to create database directory");
                        let _ = dbmgr_mgr.put(dbmgr);
                        return false;
                    }
                    dbmgr.common.pending_state = Some(State::Closed);
                    dbmgr.port = port;
                    if is_slave {
                        self.spawn(
                            dbmgr.common.id,
                            State::Closed,
                            "pg_basebackup",
                            vec![
                                "--pgdata".into(), dbmgr.db_dir.clone(),
                                "--host".into(), master_addr.clone().unwrap_or_default(),
                                "--port".into(), port.to_string(),
                                "--username".into(), replica.db_config.username.clone(),
                                "-X".into(), "stream".into(), "-P".into(),
                            ],
                            Vec::new(),
                        );
                    } else {
                        self.spawn(
                            dbmgr.common.id,
                            State::New,
                            "initdb",
                            vec![
                                "--pgdata".into(), dbmgr.db_dir.clone(),
                                "--auth".into(), "md5".into(),
                                "--username".into(), replica.db_config.username.clone(),
                            ],
                            vec![("PGPASSWORD".into(), replica.db_config.password.clone())],
                        );
                    }
                    let _ = dbmgr_mgr.put(dbmgr);
                    return false;
                } else if is_slave {
                    self.spawn(
                        dbmgr.common.id,
                        State::Closed,
                        "pg_rewind",
                        vec![
                            "--target-pgdata".into(), dbmgr.db_dir.clone(),
                            "--source-server".into(), format!("host={} port={} user={}", master_addr.unwrap_or_default(), dbmgr.port, replica.db_config.username),
                        ],
                        Vec::new(),
                    );
                }
                dbmgr.common.state = State::Closed;
                false
            }
            State::New => {
                self.spawn(dbmgr.common.id, State::Closed, "createdb", vec![replica.common.name.clone()], vec![("PGDATA".into(), dbmgr.db_dir.clone())]);
                false
            }
            State::Closed => {
                dbmgr.common.state = State::Open;
                dbmgr.port = port;
                if is_slave {
                    if let Err(e) = write_recovery_conf(&data_dir, &master_addr.unwrap_or_default(), port, &replica.db_config.username) {
                        error!(target: LOG_TARGET, err = %e, "failed to write postgres recovery config file");
                    }
                    self.spawn(
                        dbmgr.common.id,
                        State::Closed,
                        "postgres",
                        vec!["-D".into(), dbmgr.db_dir.clone(), "-c".into(), "listen_addresses=".into(), "-c".into(), format!("unix_socket_directories={}", self.config.data_dir.display())],
                        Vec::new(),
                    );
                } else {
                    if let Err(e) = write_hba_conf(&data_dir, &replica.db_config.username) {
                        error!(target: LOG_TARGET, err = %e, "failed to write postgres authentication config file");
                    }
                    self.spawn(
                        dbmgr.common.id,
                        State::Closed,
                        "postgres",
                        vec![
                            "-D".into(), dbmgr.db_dir.clone(),
                            "-c".into(), format!("unix_socket_directories={}", self.config.data_dir.display()),
                            "-c".into(), format!("port={port}"),
                            "-c".into(), "wal_level=hot_standby".into(),
                            "-c".into(), "synchronous_commit=on".into(),
                            "-c".into(), "max_wal_senders=3".into(),
                        ],
                        Vec::new(),
                    );
                }
                true
            }
            State::Open => true,
            _ => false,
        };

        let _ = dbmgr_mgr.put(dbmgr);
        result
    }
}

fn write_hba_conf(data_dir: &Path, username: &str) -> std::io::Result<()> {
    let out = format!("host all {username} 0.0.0.0/0 md5\nhost replication {username} 0.0.0.0/0 md5\n");
    std::fs::write(data_dir.join("pg_hba.conf"), out)
}

fn write_recovery_conf(data_dir: &Path, master_addr: &str, port: u16, username: &str) -> std::io::Result<()> {
    let out = format!(
        "standby_mode='on'\nprimary_conninfo='host={master_addr} port={port} user={username}'\nrecovery_target_timeline='latest'\n"
    );
    std::fs::write(data_dir.join("recovery.conf"), out)
}

fn spawn_reader<R: std::io::Read + Send + 'static>(reader: R, command: &'static str, is_stderr: bool) {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines().map_while(Result::ok) {
            if is_stderr {
                error!(target: LOG_TARGET, cmd = command, "{line}");
            } else {
                info!(target: LOG_TARGET, cmd = command, "{line}");
            }
        }
    });
}

#[cfg(unix)]
fn send_sigint(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn send_sigint(_pid: u32) {}
