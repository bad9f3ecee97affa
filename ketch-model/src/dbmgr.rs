use serde::{Deserialize, Serialize};

use crate::resource::{Common, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DBState {
    Master,
    MasterClosed,
    Slave,
    Down,
}

/// Ephemeral per-replica supervisor record; never persisted. `run_cmd`
/// and `run_env` are process handles/launch parameters owned by
/// ketch-core's supervisor and are not serialized onto the wire or disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DBMgr {
    #[serde(flatten)]
    pub common: Common,
    pub db_state: DBState,
    #[serde(default)]
    pub db_dir: String,
    #[serde(default)]
    pub port: u16,
}

impl Resource for DBMgr {
    fn common(&self) -> &Common {
        &self.common
    }
    fn common_mut(&mut self) -> &mut Common {
        &mut self.common
    }
}
