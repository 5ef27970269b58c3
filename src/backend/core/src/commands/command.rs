//! Commands and the registry that names and decodes them.
//!
//! Every command that can be scheduled is registered under a `(name, version)`
//! pair. The registry is the only way a persisted command finds its way back
//! to a concrete type, and it also records whether that type is a saga timeout.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorCode, EventideError, Result};
use crate::events::AggregateId;
use crate::sagas::SagaTimeout;

/// A request to change the state of an aggregate.
pub trait Command: Send + Sync + fmt::Debug + 'static {
    /// The aggregate the command targets.
    fn aggregate_id(&self) -> AggregateId;

    fn as_any(&self) -> &dyn Any;

    /// Name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Whether a registered command is delivered to a saga or to the command bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCapability {
    Ordinary,
    SagaTimeout,
}

/// Registered name, version and capability of a command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDefinition {
    pub name: String,
    pub version: u32,
    pub capability: CommandCapability,
    pub type_name: &'static str,
}

impl CommandDefinition {
    pub fn is_saga_timeout(&self) -> bool {
        self.capability == CommandCapability::SagaTimeout
    }
}

/// A command rebuilt from its serialized form.
#[derive(Debug)]
pub enum DecodedCommand {
    Command(Box<dyn Command>),
    SagaTimeout(Box<dyn SagaTimeout>),
}

type DecodeFn = Arc<dyn Fn(&str) -> Result<DecodedCommand> + Send + Sync>;

struct Registration {
    definition: CommandDefinition,
    decode: DecodeFn,
}

/// Maps command types to `(name, version)` definitions and back.
#[derive(Default)]
pub struct CommandRegistry {
    by_type: HashMap<TypeId, (String, u32)>,
    by_name: HashMap<(String, u32), Registration>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ordinary command.
    pub fn register<C>(&mut self, name: impl Into<String>, version: u32) -> Result<&mut Self>
    where
        C: Command + Serialize + DeserializeOwned,
    {
        self.insert::<C>(
            name.into(),
            version,
            CommandCapability::Ordinary,
            Arc::new(|data: &str| -> Result<DecodedCommand> {
                Ok(DecodedCommand::Command(Box::new(serde_json::from_str::<C>(data)?)))
            }),
        )
    }

    /// Register a saga timeout command.
    pub fn register_saga_timeout<T>(&mut self, name: impl Into<String>, version: u32) -> Result<&mut Self>
    where
        T: SagaTimeout + Serialize + DeserializeOwned,
    {
        self.insert::<T>(
            name.into(),
            version,
            CommandCapability::SagaTimeout,
            Arc::new(|data: &str| -> Result<DecodedCommand> {
                Ok(DecodedCommand::SagaTimeout(Box::new(serde_json::from_str::<T>(data)?)))
            }),
        )
    }

    fn insert<C: 'static>(
        &mut self,
        name: String,
        version: u32,
        capability: CommandCapability,
        decode: DecodeFn,
    ) -> Result<&mut Self> {
        let key = (name.clone(), version);
        let type_name = std::any::type_name::<C>();

        if let Some(existing) = self.by_name.get(&key) {
            return Err(EventideError::invalid_argument(format!(
                "Command '{}' v{} is already registered to {}",
                name, version, existing.definition.type_name
            )));
        }
        if self.by_type.contains_key(&TypeId::of::<C>()) {
            return Err(EventideError::invalid_argument(format!(
                "Command type {} is already registered",
                type_name
            )));
        }

        self.by_type.insert(TypeId::of::<C>(), key.clone());
        self.by_name.insert(
            key,
            Registration {
                definition: CommandDefinition {
                    name,
                    version,
                    capability,
                    type_name,
                },
                decode,
            },
        );
        Ok(self)
    }

    /// Definition of the command type `C`.
    pub fn definition_of<C: 'static>(&self) -> Result<&CommandDefinition> {
        self.by_type
            .get(&TypeId::of::<C>())
            .and_then(|key| self.by_name.get(key))
            .map(|registration| &registration.definition)
            .ok_or_else(|| {
                EventideError::new(
                    ErrorCode::CommandNotRegistered,
                    format!("Command type {} is not registered", std::any::type_name::<C>()),
                )
            })
    }

    /// Definition registered under `(name, version)`.
    pub fn definition(&self, name: &str, version: u32) -> Result<&CommandDefinition> {
        self.registration(name, version).map(|registration| &registration.definition)
    }

    /// Rebuild the command registered under `(name, version)` from JSON text.
    pub fn decode(&self, name: &str, version: u32, data: &str) -> Result<DecodedCommand> {
        let registration = self.registration(name, version)?;
        (registration.decode)(data).map_err(|err| {
            err.with_context("command", name)
                .with_context("version", version)
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn registration(&self, name: &str, version: u32) -> Result<&Registration> {
        self.by_name.get(&(name.to_string(), version)).ok_or_else(|| {
            EventideError::new(
                ErrorCode::CommandNotRegistered,
                format!("No command registered as '{}' v{}", name, version),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct PingCommand {
        thingy_id: String,
    }

    impl Command for PingCommand {
        fn aggregate_id(&self) -> AggregateId {
            AggregateId::new(self.thingy_id.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CommandRegistry::new();
        registry.register::<PingCommand>("Ping", 2).unwrap();

        let by_type = registry.definition_of::<PingCommand>().unwrap();
        assert_eq!(by_type.name, "Ping");
        assert_eq!(by_type.version, 2);
        assert!(!by_type.is_saga_timeout());

        let by_name = registry.definition("Ping", 2).unwrap();
        assert_eq!(by_name, by_type);
    }

    #[test]
    fn test_unknown_command() {
        let registry = CommandRegistry::new();
        let err = registry.definition_of::<PingCommand>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotRegistered);

        let err = registry.decode("Ping", 1, "{}").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotRegistered);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = CommandRegistry::new();
        registry.register::<PingCommand>("Ping", 1).unwrap();
        assert!(registry.register::<PingCommand>("Ping", 1).is_err());
        assert!(registry.register::<PingCommand>("PingAgain", 1).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decode() {
        let mut registry = CommandRegistry::new();
        registry.register::<PingCommand>("Ping", 1).unwrap();

        match registry.decode("Ping", 1, r#"{"thingy_id":"thingy-7"}"#).unwrap() {
            DecodedCommand::Command(command) => {
                assert_eq!(command.aggregate_id().as_str(), "thingy-7");
                assert!(command.as_any().downcast_ref::<PingCommand>().is_some());
            }
            DecodedCommand::SagaTimeout(_) => panic!("decoded as a saga timeout"),
        }

        let err = registry.decode("Ping", 1, "not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }
}
