use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::epoch::BallotNumber;
use crate::resource::{Common, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataState {
    InSync,
    CatchUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumMemberType {
    Sync,
    Async,
    Witness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeasePhase {
    Prepare,
    Propose,
}

/// This replica's relation to one server, captured at epoch-creation
/// time. `accepted`/`lease_owned` are per-round scratch fields the
/// proposer resets on every new prepare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumMember {
    #[serde(flatten)]
    pub common: Common,
    pub member_type: QuorumMemberType,
    pub data_state: DataState,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub lease_owned: bool,
}

/// Proposer-side per-replica view of an epoch: quorum membership plus
/// ballot and lease bookkeeping. The companion `Epoch` resource holds the
/// acceptor-side state for the same epoch id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSpec {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default)]
    pub quorum: Vec<QuorumMember>,
    pub ballot_sequence: u64,
    pub ballot_number: BallotNumber,
    pub lease_phase: LeasePhase,
    #[serde(default)]
    pub lease_owner: bool,
    pub lease_expire_uptime: i64,
}

/// Credentials and ports for the managed database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DBSpec {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub closed_port: u16,
}

/// Proposer-side record: `{id, name, memberType, dataState, state,
/// pendingState, homeServerId, masterServerId?, currentEpochId?,
/// priorEpochId?, epochs, quorumGroupSize, dbConfig}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    #[serde(flatten)]
    pub common: Common,
    pub member_type: QuorumMemberType,
    pub data_state: DataState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_epoch_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_epoch_id: Option<Uuid>,
    #[serde(default)]
    pub epochs: BTreeMap<Uuid, EpochSpec>,
    pub quorum_group_size: u32,
    pub home_server_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_server_id: Option<Uuid>,
    pub db_config: DBSpec,
}

impl Resource for Replica {
    fn common(&self) -> &Common {
        &self.common
    }
    fn common_mut(&mut self) -> &mut Common {
        &mut self.common
    }
}

impl Replica {
    pub fn current_epoch(&self) -> Option<&EpochSpec> {
        self.current_epoch_id.and_then(|id| self.epochs.get(&id))
    }

    pub fn current_epoch_mut(&mut self) -> Option<&mut EpochSpec> {
        let id = self.current_epoch_id?;
        self.epochs.get_mut(&id)
    }
}
