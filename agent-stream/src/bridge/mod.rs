//! TransportBridge - the only channel between foreground and background.
//!
//! The foreground sends `ForegroundMsg` values and receives `BackgroundMsg`
//! values. Everything network-facing lives behind the bridge in a
//! `ConnectionActor`; the foreground never touches a transport directly.

pub mod frame;

use std::sync::Arc;

use ractor::{Actor, ActorRef};
use shared_types::{BackgroundMsg, ForegroundMsg};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionActor, ConnectionArguments, ConnectionMsg, ConnectionState};
use crate::transport::{QueryClient, StreamConnector};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Failed to start background context: {0}")]
    Spawn(String),

    #[error("Background context is gone")]
    Closed,
}

pub struct TransportBridge {
    actor: ActorRef<ConnectionMsg>,
    handle: Option<JoinHandle<()>>,
    inbound: mpsc::UnboundedReceiver<BackgroundMsg>,
}

impl TransportBridge {
    /// Starts the background context for one session.
    pub async fn spawn(
        session_id: impl Into<String>,
        connector: Arc<dyn StreamConnector>,
        query_client: Arc<dyn QueryClient>,
        max_frame_bytes: usize,
    ) -> Result<Self, BridgeError> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let args = ConnectionArguments {
            session_id: session_id.into(),
            connector,
            query_client,
            outbound,
            max_frame_bytes,
        };
        let (actor, handle) = Actor::spawn(None, ConnectionActor, args)
            .await
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        Ok(Self {
            actor,
            handle: Some(handle),
            inbound,
        })
    }

    pub fn send(&self, msg: ForegroundMsg) -> Result<(), BridgeError> {
        self.actor
            .cast(ConnectionMsg::Command(msg))
            .map_err(|_| BridgeError::Closed)
    }

    /// Next background message; `None` once the background context is gone.
    pub async fn recv(&mut self) -> Option<BackgroundMsg> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BackgroundMsg> {
        self.inbound.try_recv().ok()
    }

    /// Current connection state machine, for diagnostics and tests.
    pub async fn connection_state(&self) -> Result<ConnectionState, BridgeError> {
        ractor::call!(self.actor, |reply| ConnectionMsg::GetState { reply })
            .map_err(|_| BridgeError::Closed)
    }

    /// Disconnects and waits for the background context to stop.
    pub async fn shutdown(mut self) {
        let _ = self.actor.cast(ConnectionMsg::Command(ForegroundMsg::Disconnect));
        self.actor.stop(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        self.actor.stop(None);
    }
}
