mod dbmgr;
mod epoch;
mod replica;
mod resource;
mod runtime;
mod server;

pub use dbmgr::{DBMgr, DBState};
pub use epoch::{AcceptorState, BallotNumber, Epoch};
pub use replica::{DBSpec, DataState, EpochSpec, LeasePhase, QuorumMember, QuorumMemberType, Replica};
pub use resource::{Common, Endpoint, Resource, ResourceType, State};
pub use runtime::Runtime;
pub use server::Server;
