mod dispatch;
mod envelope;
mod membership;
mod msg;
mod transport;

pub use dispatch::{inbound_channel, INBOUND_CHANNEL_CAPACITY};
pub use envelope::{from_bytes, to_bytes};
pub use membership::{Membership, NodeInfo};
pub use msg::{
    Common, EpochCloseReq, EpochCloseResp, EpochOpenReq, EpochOpenResp, EpochRevokeReq,
    EpochRevokeResp, EpochSetupReq, EpochSetupResp, LeasePrepareReq, LeasePrepareResp,
    LeaseProposeReq, LeaseProposeResp, Msg, ReplicaCreateReq, ReplicaCreateResp,
};
pub use transport::Transport;
