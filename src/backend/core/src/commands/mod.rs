//! Commands: registration, publication and scheduling.

pub mod bus;
pub mod command;
pub mod scheduler;

pub use bus::*;
pub use command::*;
pub use scheduler::*;
