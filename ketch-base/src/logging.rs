// Initializes the process-wide tracing subscriber. Every event emitted
// by this crate family uses `LOG_TARGET` so a single `RUST_LOG=ketch=debug`
// captures the whole service.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ketch=info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
