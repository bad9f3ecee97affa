use serde::{Deserialize, Serialize};

use crate::resource::{Common, Endpoint, Resource};

/// One per known peer, derived fresh from the membership snapshot on
/// every service tick. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    #[serde(flatten)]
    pub common: Common,
    pub endpoint: Endpoint,
}

impl Resource for Server {
    fn common(&self) -> &Common {
        &self.common
    }
    fn common_mut(&mut self) -> &mut Common {
        &mut self.common
    }
}
