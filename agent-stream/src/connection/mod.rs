//! Connection management: the pure state machine and the actor that runs it.

pub mod actor;
pub mod machine;

pub use actor::{ConnectionActor, ConnectionArguments, ConnectionMsg};
pub use machine::{ConnectionEvent, ConnectionState, Effect, ReconnectPolicy, RECONNECT_CAP};
