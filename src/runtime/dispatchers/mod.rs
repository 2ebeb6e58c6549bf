//! Background dispatchers: workflow turns and activity execution.

pub mod worker;
pub mod workflow;
