//! Sagas and the delivery of scheduled saga timeouts.
//!
//! A saga timeout is a command that carries the id of the saga it belongs to.
//! When its job fires, the timeout is routed here instead of the command bus:
//! the saga is loaded from the `SagaStore` and the handler registered for the
//! timeout type is invoked with exclusive access to it.

pub mod dispatch;
pub mod store;
pub mod timeout;

pub use dispatch::*;
pub use store::*;
pub use timeout::*;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Identifier of a saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(String);

impl SagaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SagaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A long-running process reacting to events and its own timeouts.
pub trait Saga: Send + Sync + 'static {
    fn saga_id(&self) -> &SagaId;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
