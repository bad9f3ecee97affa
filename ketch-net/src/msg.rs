use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ketch_model::{BallotNumber, Replica, State};

/// Fields carried by every message, independent of its specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Common {
    pub dest_id: Uuid,
    pub src_id: Uuid,
    pub replica_id: Uuid,
    pub epoch_id: Uuid,
}

macro_rules! msg_with_common {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $name {
            pub common: Common,
            $(pub $field: $ty,)*
        }
    };
}

msg_with_common!(EpochSetupReq {});
msg_with_common!(EpochSetupResp {});
msg_with_common!(EpochOpenReq {});
msg_with_common!(EpochOpenResp {});
msg_with_common!(EpochCloseReq {});
msg_with_common!(EpochCloseResp {});
msg_with_common!(EpochRevokeReq { successor_epoch_id: Uuid });
msg_with_common!(EpochRevokeResp {});

msg_with_common!(LeasePrepareReq {
    ballot_number: BallotNumber,
    successor_epoch_id: Option<Uuid>,
});
msg_with_common!(LeasePrepareResp {
    ballot_number: BallotNumber,
    highest_promised: BallotNumber,
    proposal_owner_id: Option<Uuid>,
    successor_mismatch: bool,
});

msg_with_common!(LeaseProposeReq {
    ballot_number: BallotNumber,
    proposed_timeout: u16,
});
msg_with_common!(LeaseProposeResp {
    ballot_number: BallotNumber,
    has_accepted_proposal: bool,
    proposal_owner_id: Option<Uuid>,
    epoch_state: State,
});

msg_with_common!(ReplicaCreateReq { replica: Replica });
msg_with_common!(ReplicaCreateResp {});

/// The full message catalogue from the wire protocol, tagged by a
/// one-byte discriminant ahead of the self-describing payload. Using an
/// externally tagged serde enum gives us that tag almost for free through
/// `rmp_serde`, while keeping one Rust type per wire message the way the
/// original message package does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Msg {
    EpochSetupReq(EpochSetupReq),
    EpochSetupResp(EpochSetupResp),
    EpochOpenReq(EpochOpenReq),
    EpochOpenResp(EpochOpenResp),
    EpochCloseReq(EpochCloseReq),
    EpochCloseResp(EpochCloseResp),
    EpochRevokeReq(EpochRevokeReq),
    EpochRevokeResp(EpochRevokeResp),
    LeasePrepareReq(LeasePrepareReq),
    LeasePrepareResp(LeasePrepareResp),
    LeaseProposeReq(LeaseProposeReq),
    LeaseProposeResp(LeaseProposeResp),
    ReplicaCreateReq(ReplicaCreateReq),
    ReplicaCreateResp(ReplicaCreateResp),
}

impl Msg {
    pub fn common(&self) -> &Common {
        match self {
            Msg::EpochSetupReq(m) => &m.common,
            Msg::EpochSetupResp(m) => &m.common,
            Msg::EpochOpenReq(m) => &m.common,
            Msg::EpochOpenResp(m) => &m.common,
            Msg::EpochCloseReq(m) => &m.common,
            Msg::EpochCloseResp(m) => &m.common,
            Msg::EpochRevokeReq(m) => &m.common,
            Msg::EpochRevokeResp(m) => &m.common,
            Msg::LeasePrepareReq(m) => &m.common,
            Msg::LeasePrepareResp(m) => &m.common,
            Msg::LeaseProposeReq(m) => &m.common,
            Msg::LeaseProposeResp(m) => &m.common,
            Msg::ReplicaCreateReq(m) => &m.common,
            Msg::ReplicaCreateResp(m) => &m.common,
        }
    }
}
