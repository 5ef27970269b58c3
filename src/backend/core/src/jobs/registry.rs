//! Rebuilds queued jobs from their persisted `(name, version)` and JSON.

use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::error::{ErrorCode, EventideError, Result};

use super::{Job, JobEnvelope, QueuedJob};

type JobDecoder = fn(serde_json::Value) -> Result<Box<dyn Job>>;

fn decode_job<J>(data: serde_json::Value) -> Result<Box<dyn Job>>
where
    J: Job + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_json::from_value::<J>(data)?))
}

/// Job types known to a worker.
#[derive(Default)]
pub struct JobRegistry {
    decoders: HashMap<(String, u32), JobDecoder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that knows the scheduled command envelope.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<JobEnvelope>(JobEnvelope::JOB_NAME, JobEnvelope::JOB_VERSION);
        registry
    }

    /// Register job type `J` under `(name, version)`, replacing any previous decoder.
    pub fn register<J>(&mut self, name: impl Into<String>, version: u32) -> &mut Self
    where
        J: Job + DeserializeOwned + 'static,
    {
        self.decoders.insert((name.into(), version), decode_job::<J>);
        self
    }

    pub fn contains(&self, name: &str, version: u32) -> bool {
        self.decoders.contains_key(&(name.to_string(), version))
    }

    /// Rebuild the executable job stored in `queued`.
    pub fn decode(&self, queued: &QueuedJob) -> Result<Box<dyn Job>> {
        let name = &queued.metadata.job_type;
        let version = queued.metadata.job_version;

        let decoder = self.decoders.get(&(name.clone(), version)).ok_or_else(|| {
            EventideError::new(
                ErrorCode::JobNotRegistered,
                format!("No job registered as '{}' v{}", name, version),
            )
        })?;

        decoder(queued.data.clone()).map_err(|err| err.with_context("job", name).with_context("version", version))
    }
}
