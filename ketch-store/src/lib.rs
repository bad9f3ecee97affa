mod persistence;
mod store;

pub use persistence::Persistence;
pub use store::{CreateError, NoHooks, ResourceHooks, ResourceMgr, ValidationError};
