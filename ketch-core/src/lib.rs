mod dbsupervisor;
mod epoch;
mod orchestrator;
mod service;

pub use dbsupervisor::{DbConfig, DbExited, DbSupervisor};
pub use orchestrator::Orchestrator;
pub use service::Service;
