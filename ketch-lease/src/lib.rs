mod acceptor;
mod constants;
mod proposer;

pub use acceptor::{on_lease_prepare_req, on_lease_propose_req};
pub use constants::{LEASE_GRACE, LEASE_PERIOD, LEASE_RENEW_BEFORE, RETRANSMIT_INTERVAL};
pub use proposer::{on_lease_prepare_resp, on_lease_propose_resp, send_lease_prepare_reqs};
