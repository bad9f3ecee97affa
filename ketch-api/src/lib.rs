mod envelope;
mod server;

pub use envelope::{CreateRequest, Envelope, Record};
pub use server::ApiServer;
