//! Stable identity of the aggregated bridge node

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node id of the bridge and name of its storage namespace
pub const DEFAULT_NODE_ID: &str = "bridge-0";

/// Unique id reported in the basic information cluster of the bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(pub String);

impl UniqueId {
    /// Mint a fresh random id: 32 lowercase hex characters, no separators
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The fixed id used by bridges created before ids were persisted
    pub fn legacy() -> Self {
        Self(DEFAULT_NODE_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
