//! Agent Stream - streaming UI patch client
//!
//! Receives patch batches from an agent backend over a server-push stream,
//! validates and applies them to an immutable UI document, and keeps the
//! connection alive with heartbeat checks and capped exponential backoff.
//! Network work runs in a background actor; the foreground `CommandDispatcher`
//! owns the document and talks to it only through the `TransportBridge`.

pub mod bridge;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod settings;
pub mod transport;

pub use dispatcher::{CommandDispatcher, DispatchError, DispatcherOptions, DispatcherState};
pub use settings::{ClientSettings, SettingsError};
