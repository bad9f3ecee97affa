use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::resource::{Common, Endpoint, Resource};

/// One per node, persisted. Its `id` is the stable wire identity,
/// generated on first start and preserved across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    #[serde(flatten)]
    pub common: Common,
    pub endpoint: Endpoint,
    pub boot_time: SystemTime,
}

impl Resource for Runtime {
    fn common(&self) -> &Common {
        &self.common
    }
    fn common_mut(&mut self) -> &mut Common {
        &mut self.common
    }
}
