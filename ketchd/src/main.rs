use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

use ketch_api::ApiServer;
use ketch_base::{fatal, HostClock, LOG_TARGET};
use ketch_core::{DbConfig, Service};
use ketch_model::Endpoint;
use ketch_net::{inbound_channel, Membership, NodeInfo, Transport};
use ketch_store::Persistence;

const STORE_NAME: &str = "ketch.db";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const LIVENESS: Duration = Duration::from_secs(6);

#[derive(Parser)]
#[command(name = "ketchd")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boots the service loop: membership, dispatcher, orchestrator tick, and the management API.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, env = "KETCH_API_SERVER", default_value = "0.0.0.0")]
    api_server: IpAddr,
    #[arg(long, env = "KETCH_API_PORT", default_value_t = 7460)]
    api_port: u16,
    #[arg(long, env = "KETCH_MEMBER_SERVER", default_value = "0.0.0.0")]
    member_server: IpAddr,
    #[arg(long, env = "KETCH_MEMBER_PORT", default_value_t = 7459)]
    member_port: u16,
    #[arg(long, env = "KETCH_MEMBER_LIST", value_delimiter = ',')]
    member_list: Vec<String>,
    #[arg(long, env = "KETCH_DATA_DIR", default_value = "/var/lib/ketch")]
    data_dir: PathBuf,
    #[arg(long, env = "KETCH_DB_BIN_DIR", default_value = "/usr/lib/postgresql/bin")]
    db_bin_dir: PathBuf,
}

fn main() {
    ketch_base::init_logging();
    let cli = Cli::parse();
    let Command::Run(args) = cli.command;
    run(args);
}

fn run(args: RunArgs) {
    let bootstrap = resolve_bootstrap(&args.member_list);

    let member_endpoint = Endpoint { addr: args.member_server, port: args.member_port };
    let member_socket = match UdpSocket::bind(SocketAddr::new(member_endpoint.addr, member_endpoint.port)) {
        Ok(socket) => socket,
        Err(e) => fatal(format!("failed to bind membership port {}: {e}", member_endpoint.port)),
    };

    let persistence = match Persistence::open(&args.data_dir, STORE_NAME) {
        Ok(p) => Arc::new(p),
        Err(e) => fatal(format!("failed to open resource store: {e}")),
    };

    let name = hostname();
    let local = NodeInfo { id: Uuid::new_v4(), name: name.clone(), endpoint: member_endpoint };
    let membership = Arc::new(Membership::new(member_socket, local, LIVENESS));

    let transport = match Transport::bind(SocketAddr::new(member_endpoint.addr, 0)) {
        Ok(t) => t,
        Err(e) => fatal(format!("failed to bind outbound transport socket: {e}")),
    };

    let db_config = DbConfig { data_dir: args.data_dir.clone(), db_bin_dir: args.db_bin_dir.clone() };
    let clock = Box::new(HostClock::new());

    let service = match Service::new(name, member_endpoint, db_config, persistence, membership.clone(), transport, clock) {
        Ok(s) => Arc::new(s),
        Err(e) => fatal(format!("failed to start service: {e}")),
    };

    install_signal_handler();

    let recv_membership = membership.clone();
    let (inbound_tx, inbound_rx) = inbound_channel();
    thread::spawn(move || recv_membership.recv_loop(inbound_tx));

    let heartbeat_membership = membership.clone();
    thread::spawn(move || loop {
        if let Err(e) = heartbeat_membership.heartbeat(&bootstrap) {
            error!(target: LOG_TARGET, err = ?e, "heartbeat send failed");
        }
        thread::sleep(HEARTBEAT_INTERVAL);
    });

    let dispatch_service = service.clone();
    thread::spawn(move || {
        while let Ok(msg) = inbound_rx.recv() {
            dispatch_service.dispatch(msg);
        }
    });

    let tick_service = service.clone();
    thread::spawn(move || loop {
        let next_period = tick_service.tick();
        thread::sleep(Duration::from_secs(next_period as u64));
    });

    info!(target: LOG_TARGET, api = %args.api_server, port = args.api_port, "management API listening");
    let api_endpoint = Endpoint { addr: args.api_server, port: args.api_port };
    let api_service = service.clone();
    thread::spawn(move || {
        let api = ApiServer::new(api_service);
        if let Err(e) = api.serve(api_endpoint) {
            fatal(format!("management API failed: {e}"));
        }
    });

    wait_for_shutdown(&service);
}

fn resolve_bootstrap(member_list: &[String]) -> Vec<SocketAddr> {
    member_list
        .iter()
        .filter_map(|entry| match entry.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                error!(target: LOG_TARGET, entry, err = %e, "failed to resolve bootstrap peer");
                None
            }
        })
        .collect()
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    #[cfg(unix)]
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..len]) {
                return name.to_string();
            }
        }
    }
    format!("ketch-{}", Uuid::new_v4())
}

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_signal as libc::sighandler_t);
    }
}

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

#[cfg(not(unix))]
fn install_signal_handler() {}

/// Polls the shutdown flag set by the signal handler; real work happens
/// on the tick/dispatch/API threads. Exits with status 1 once a signal
/// arrives, per the exit-code contract: only a clean, un-signaled stop
/// of the API server would return 0, which `ApiServer::serve` never
/// does short of a bind failure.
fn wait_for_shutdown(service: &Service) -> ! {
    loop {
        if SHUTTING_DOWN.load(Ordering::SeqCst) {
            info!(target: LOG_TARGET, "shutdown signal received");
            service.shutdown_databases();
            std::process::exit(1);
        }
        thread::sleep(Duration::from_millis(200));
    }
}
