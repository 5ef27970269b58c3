//! Event Sourcing System
//!
//! - **`position`**: the global position cursor codec.
//! - **`event`**: identifiers, metadata, serialized and committed event records.
//! - **`log`**: the `EventLog` trait implemented by backing stores.
//! - **`memory`** / **`postgres`**: in-memory and PostgreSQL event logs.
//! - **`persistence`**: the `EventPersistence` engine aggregates commit and read through.
//! - **`aggregate`**: the `Aggregate` trait and snapshot-aware `AggregateLoader`.

pub mod aggregate;
pub mod event;
pub mod log;
pub mod memory;
pub mod persistence;
pub mod position;
pub mod postgres;

pub use aggregate::*;
pub use event::*;
pub use log::*;
pub use memory::*;
pub use persistence::*;
pub use position::*;
pub use postgres::*;
