//! Snapshots
//!
//! - **`upgrade`**: the `SnapshotUpgradeChain` that brings stored snapshots up
//!   to the current version one step at a time.
//! - **`store`**: the `SnapshotStore` trait and an in-memory implementation.

pub mod store;
pub mod upgrade;

pub use store::*;
pub use upgrade::*;

use serde::{Deserialize, Serialize};

/// Versioned snapshot of aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,

    pub state: serde_json::Value,

    /// Versions this snapshot was upgraded from, oldest first.
    #[serde(default)]
    pub previous_versions: Vec<u32>,
}

impl Snapshot {
    pub fn new(version: u32, state: serde_json::Value) -> Self {
        Self {
            version,
            state,
            previous_versions: Vec::new(),
        }
    }

    pub fn with_previous_versions(mut self, previous_versions: Vec<u32>) -> Self {
        self.previous_versions = previous_versions;
        self
    }
}
