use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state shared by every resource kind, plus the epoch-only
/// `Delete` value used as a pending-state marker for revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Uninitialized,
    New,
    Open,
    Closed,
    Delete,
}

/// Attributes every resource carries: an optional human name, an
/// identifier, and the lifecycle state pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Common {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_state: Option<State>,
}

/// The Ketch membership endpoint shared by Runtime and Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: std::net::IpAddr,
    pub port: u16,
}

/// Tags each resource kind the store knows about. Used to dispatch to the
/// per-kind policy flags and hooks the resource store applies uniformly
/// (assign_ids/named/persist, init/refresh/post_load hooks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    Runtime,
    Server,
    Epoch,
    Replica,
    DBMgr,
}

/// Implemented by every resource value type so the generic store can
/// read/write identity and lifecycle state without knowing the concrete
/// type. Mirrors the source `Resource` interface's `GetCommon()`.
pub trait Resource {
    fn common(&self) -> &Common;
    fn common_mut(&mut self) -> &mut Common;
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Runtime => "runtime",
            ResourceType::Server => "server",
            ResourceType::Epoch => "epoch",
            ResourceType::Replica => "replica",
            ResourceType::DBMgr => "dbmgr",
        }
    }

    pub const ALL: [ResourceType; 5] = [
        ResourceType::Runtime,
        ResourceType::Server,
        ResourceType::Epoch,
        ResourceType::Replica,
        ResourceType::DBMgr,
    ];
}
