use std::sync::Arc;
use std::thread;

use tiny_http::{Header, Method, Response};
use tracing::error;

use ketch_base::{err, Result, LOG_TARGET};
use ketch_core::Service;
use ketch_model::{Endpoint, Replica};

use crate::envelope::{CreateRequest, Envelope};

/// Number of threads pulling requests off the one `tiny_http::Server`.
/// Small and fixed: every request takes the same global lock as the
/// dispatcher and service-tick threads, so there is no benefit to a
/// larger pool, only more contention.
const THREAD_POOL_SIZE: usize = 4;

/// Serves the management HTTP/JSON API. Holds no state of its own beyond
/// the `Service` handle; every request is just another caller into the
/// core, taking the same lock the dispatcher and service loop take.
pub struct ApiServer {
    service: Arc<Service>,
}

impl ApiServer {
    pub fn new(service: Arc<Service>) -> ApiServer {
        ApiServer { service }
    }

    /// Binds `endpoint` and blocks the calling thread, fanning requests
    /// out across `THREAD_POOL_SIZE` worker threads. Returns only on
    /// bind failure.
    pub fn serve(self, endpoint: Endpoint) -> Result<()> {
        let http = tiny_http::Server::http((endpoint.addr, endpoint.port))
            .map_err(|e| err(format!("failed to bind management API on {endpoint:?}: {e}")))?;
        let http = Arc::new(http);
        let service = self.service;

        let workers: Vec<_> = (1..THREAD_POOL_SIZE)
            .map(|_| {
                let http = http.clone();
                let service = service.clone();
                thread::spawn(move || worker_loop(&http, &service))
            })
            .collect();

        worker_loop(&http, &service);
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }
}

fn worker_loop(http: &tiny_http::Server, service: &Service) {
    loop {
        match http.recv() {
            Ok(request) => handle_request(service, request),
            Err(e) => {
                error!(target: LOG_TARGET, err = ?e, "management API accept failed");
                return;
            }
        }
    }
}

fn handle_request(service: &Service, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let segments: Vec<&str> = request.url().trim_matches('/').split('/').collect();

    let respond = match (&method, segments.as_slice()) {
        (Method::Get, ["api", "v1", "runtime"]) => respond_list(service.list_runtime(), "runtime"),
        (Method::Get, ["api", "v1", "server"]) => respond_list(service.list_server(), "server"),
        (Method::Get, ["api", "v1", "epoch"]) => respond_list(service.list_epoch(), "epoch"),
        (Method::Get, ["api", "v1", "replica"]) => respond_list(service.list_replica(), "replica"),
        (Method::Get, ["api", "v1", "dbmgr"]) => respond_list(service.list_dbmgr(), "dbmgr"),
        (Method::Post, ["api", "v1", "replica"]) => respond_create_replica(service, &mut request),
        _ => not_found(),
    };

    let json_header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
    let response = Response::from_string(respond.body).with_status_code(respond.status).with_header(json_header);
    if let Err(e) = request.respond(response) {
        error!(target: LOG_TARGET, err = ?e, "failed to write management API response");
    }
}

struct Respond {
    status: u16,
    body: String,
}

fn respond_list<T: serde::Serialize>(result: Result<Vec<T>>, kind: &str) -> Respond {
    match result {
        Ok(items) => json_respond(200, &Envelope::list(kind, items)),
        Err(e) => {
            error!(target: LOG_TARGET, err = ?e, "management API list failed");
            json_respond(500, &Envelope::<T>::error(e.to_string()))
        }
    }
}

fn respond_create_replica(service: &Service, request: &mut tiny_http::Request) -> Respond {
    let body: CreateRequest<Replica> = match serde_json::from_reader(request.as_reader()) {
        Ok(body) => body,
        Err(e) => return json_respond(400, &Envelope::<Replica>::error(format!("invalid request body: {e}"))),
    };
    let replicas: Vec<Replica> = body.data.into_iter().map(|record| record.attributes).collect();

    match service.create_replica(replicas) {
        Ok(created) => json_respond(201, &Envelope::list("replica", created)),
        Err(e) => json_respond(e.status_code(), &Envelope::<Replica>::error(e.to_string())),
    }
}

fn not_found() -> Respond {
    json_respond(404, &Envelope::<()>::error("no such route"))
}

fn json_respond<T: serde::Serialize>(status: u16, envelope: &Envelope<T>) -> Respond {
    match serde_json::to_string(envelope) {
        Ok(body) => Respond { status, body },
        Err(e) => Respond { status: 500, body: format!("{{\"data\":[],\"errors\":[\"{e}\"]}}") },
    }
}
