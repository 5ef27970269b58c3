//! Snapshot upgrade chain.
//!
//! Each upgrader turns a snapshot of version `n` into version `n + 1`. The chain
//! applies upgraders one step at a time until the snapshot reaches the current
//! version, recording every version it passed through.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ErrorCode, EventideError, Result};

use super::Snapshot;

/// Typed single-step snapshot upgrader.
pub trait SnapshotUpgrader: Send + Sync + 'static {
    /// Snapshot state at `FROM_VERSION`.
    type From: DeserializeOwned;
    /// Snapshot state at `TO_VERSION`.
    type To: Serialize;

    const FROM_VERSION: u32;
    const TO_VERSION: u32;

    fn upgrade(&self, from: Self::From) -> Result<Self::To>;
}

type UpgradeFn = Box<dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

struct UpgradeStep {
    name: String,
    upgrade: UpgradeFn,
}

/// Registry of upgrade steps keyed by source version.
pub struct SnapshotUpgradeChain {
    current_version: u32,
    steps: BTreeMap<u32, UpgradeStep>,
}

impl SnapshotUpgradeChain {
    /// Create an empty chain for snapshots whose latest version is `current_version`.
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            steps: BTreeMap::new(),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Register a typed upgrader.
    pub fn register<U: SnapshotUpgrader>(&mut self, upgrader: U) -> Result<&mut Self> {
        if U::TO_VERSION != U::FROM_VERSION + 1 {
            return Err(EventideError::new(
                ErrorCode::SnapshotVersionInvalid,
                format!(
                    "Snapshot upgrader {} must target version {}, not {}",
                    std::any::type_name::<U>(),
                    U::FROM_VERSION + 1,
                    U::TO_VERSION
                ),
            ));
        }

        let name = std::any::type_name::<U>().to_string();
        self.insert(
            U::FROM_VERSION,
            name,
            Box::new(move |state: serde_json::Value| -> Result<serde_json::Value> {
                let from: U::From = serde_json::from_value(state)?;
                let to = upgrader.upgrade(from)?;
                Ok(serde_json::to_value(to)?)
            }),
        )
    }

    /// Register an untyped step operating on raw JSON state.
    pub fn register_fn<F>(&mut self, from_version: u32, name: impl Into<String>, upgrade: F) -> Result<&mut Self>
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.insert(from_version, name.into(), Box::new(upgrade))
    }

    fn insert(&mut self, from_version: u32, name: String, upgrade: UpgradeFn) -> Result<&mut Self> {
        if from_version >= self.current_version {
            return Err(EventideError::new(
                ErrorCode::SnapshotVersionInvalid,
                format!(
                    "Snapshot upgrader {} starts at version {}, which is not older than the current version {}",
                    name, from_version, self.current_version
                ),
            ));
        }

        if let Some(existing) = self.steps.get(&from_version) {
            return Err(EventideError::new(
                ErrorCode::SnapshotVersionInvalid,
                format!(
                    "Snapshot upgrader {} conflicts with {} for version {}",
                    name, existing.name, from_version
                ),
            ));
        }

        self.steps.insert(from_version, UpgradeStep { name, upgrade });
        Ok(self)
    }

    /// Upgrade `snapshot` to the current version.
    ///
    /// Each applied step appends its source version to `previous_versions`.
    /// A snapshot already at the current version is returned unchanged.
    pub fn upgrade(&self, snapshot: Snapshot) -> Result<Snapshot> {
        if snapshot.version > self.current_version {
            return Err(EventideError::new(
                ErrorCode::SnapshotVersionInvalid,
                format!(
                    "Snapshot version {} is newer than the current version {}",
                    snapshot.version, self.current_version
                ),
            ));
        }

        let Snapshot {
            mut version,
            mut state,
            mut previous_versions,
        } = snapshot;

        while version < self.current_version {
            let step = self.steps.get(&version).ok_or_else(|| {
                EventideError::new(
                    ErrorCode::SnapshotUpgradeMissing,
                    format!("No snapshot upgrader registered for version {}", version),
                )
            })?;

            state = (step.upgrade)(state)?;
            previous_versions.push(version);
            debug!(upgrader = %step.name, from = version, to = version + 1, "Upgraded snapshot");
            version += 1;
        }

        Ok(Snapshot {
            version,
            state,
            previous_versions,
        })
    }
}
