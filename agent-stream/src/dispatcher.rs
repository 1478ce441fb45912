//! CommandDispatcher - foreground owner of the visible session state.
//!
//! Turns user actions into bridge commands and folds background messages into
//! `DispatcherState`. Every background message goes through `handle_message`
//! on `&mut self`, so patch batches are applied one at a time in arrival
//! order. Each change is published as an immutable snapshot on a `watch`
//! channel.

use std::sync::Arc;

use shared_types::{
    AgentResponse, BackgroundMsg, ConnectionConfig, ConnectionPhase, ConnectionStatus,
    ForegroundMsg, LogLevel, PatchError, UiDocument,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bridge::{BridgeError, TransportBridge};
use crate::connection::ConnectionState;
use crate::protocol::{PatchEngine, PatchLimits};
use crate::transport::{QueryClient, StreamConnector};

/// Patch errors kept for display; older ones are discarded first.
pub const MAX_PATCH_ERRORS: usize = 200;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Not connected (connection is {0})")]
    NotConnected(ConnectionPhase),

    #[error("Message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatcherState {
    pub ui_document: Arc<UiDocument>,
    pub connection: ConnectionStatus,
    pub last_error: Option<String>,
    pub patch_errors: Vec<PatchError>,
    pub last_message: Option<String>,
}

/// Everything needed to start a session.
#[derive(Clone)]
pub struct DispatcherOptions {
    pub endpoint: String,
    pub config: ConnectionConfig,
    pub limits: PatchLimits,
    pub max_frame_bytes: usize,
    pub connector: Arc<dyn StreamConnector>,
    pub query_client: Arc<dyn QueryClient>,
}

pub struct CommandDispatcher {
    bridge: TransportBridge,
    session_id: String,
    endpoint: String,
    config: ConnectionConfig,
    engine: PatchEngine,
    state: DispatcherState,
    updates: watch::Sender<Arc<DispatcherState>>,
}

impl CommandDispatcher {
    /// Starts the background context for a new session. Does not connect.
    pub async fn start(options: DispatcherOptions) -> Result<Self, DispatchError> {
        let session_id = Uuid::new_v4().to_string();
        let bridge = TransportBridge::spawn(
            session_id.clone(),
            options.connector,
            options.query_client,
            options.max_frame_bytes,
        )
        .await?;

        let state = DispatcherState::default();
        let (updates, _) = watch::channel(Arc::new(state.clone()));
        tracing::info!(session_id = %session_id, endpoint = %options.endpoint, "Session started");

        Ok(Self {
            bridge,
            session_id,
            endpoint: options.endpoint,
            config: options.config,
            engine: PatchEngine::new(options.limits),
            state,
            updates,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &DispatcherState {
        &self.state
    }

    pub fn document(&self) -> Arc<UiDocument> {
        self.state.ui_document.clone()
    }

    /// Snapshot feed for the presentation layer.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DispatcherState>> {
        self.updates.subscribe()
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, DispatchError> {
        Ok(self.bridge.connection_state().await?)
    }

    pub fn connect(&self) -> Result<(), DispatchError> {
        self.send_connect()
    }

    /// Explicit reconnect; also the only way out of `Failed`.
    pub fn reconnect(&self) -> Result<(), DispatchError> {
        tracing::info!(session_id = %self.session_id, "Reconnect requested");
        self.send_connect()
    }

    /// Disconnects; the local connection state is `Idle` immediately.
    pub fn disconnect(&mut self) -> Result<(), DispatchError> {
        tracing::info!(session_id = %self.session_id, "Disconnect requested");
        self.bridge.send(ForegroundMsg::Disconnect)?;
        self.state.connection = ConnectionStatus::default();
        self.publish();
        Ok(())
    }

    fn send_connect(&self) -> Result<(), DispatchError> {
        Ok(self.bridge.send(ForegroundMsg::Connect {
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
        })?)
    }

    /// Sends a query over the side-channel; returns its request id.
    pub fn send_message(&mut self, text: &str) -> Result<String, DispatchError> {
        let message = text.trim();
        if message.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        if self.state.connection.phase != ConnectionPhase::Open {
            return Err(DispatchError::NotConnected(self.state.connection.phase));
        }

        let request_id = Uuid::new_v4().to_string();
        self.bridge.send(ForegroundMsg::SendQuery {
            message: message.to_string(),
            request_id: request_id.clone(),
            session_id: self.session_id.clone(),
        })?;
        tracing::debug!(request_id = %request_id, "Query dispatched");
        Ok(request_id)
    }

    pub fn clear_errors(&mut self) {
        self.state.patch_errors.clear();
        self.state.last_error = None;
        self.publish();
    }

    /// Waits for the next background message and applies it. `None` once the
    /// background context has stopped.
    pub async fn next(&mut self) -> Option<Arc<DispatcherState>> {
        let msg = self.bridge.recv().await?;
        self.handle_message(msg);
        Some(self.updates.borrow().clone())
    }

    /// Applies every background message already queued; returns how many.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.bridge.try_recv() {
            self.handle_message(msg);
            handled += 1;
        }
        handled
    }

    pub fn handle_message(&mut self, msg: BackgroundMsg) {
        match msg {
            BackgroundMsg::ConnectionStatus(status) => {
                if status.error.is_some() {
                    self.state.last_error = status.error.clone();
                }
                self.state.connection = status;
            }
            BackgroundMsg::AgentResponse(response) => self.apply_response(response),
            BackgroundMsg::Error { message } => {
                tracing::warn!(session_id = %self.session_id, "{message}");
                self.state.last_error = Some(message);
            }
            BackgroundMsg::Log { message, level } => {
                match level {
                    LogLevel::Debug => tracing::debug!(source = "background", "{message}"),
                    LogLevel::Info => tracing::info!(source = "background", "{message}"),
                    LogLevel::Warn => tracing::warn!(source = "background", "{message}"),
                    LogLevel::Error => tracing::error!(source = "background", "{message}"),
                }
                return;
            }
        }
        self.publish();
    }

    fn apply_response(&mut self, response: AgentResponse) {
        if let Some(batch) = response.batch() {
            let outcome = self.engine.apply(&self.state.ui_document, &batch);
            tracing::debug!(
                request_id = %batch.request_id,
                applied = outcome.applied,
                rejected = outcome.errors.len(),
                version = outcome.document.version,
                "Patch batch applied"
            );
            self.state.ui_document = Arc::new(outcome.document);
            self.state.patch_errors.extend(outcome.errors);
            let overflow = self.state.patch_errors.len().saturating_sub(MAX_PATCH_ERRORS);
            if overflow > 0 {
                self.state.patch_errors.drain(..overflow);
            }
        }
        if let Some(message) = response.message {
            self.state.last_message = Some(message);
        }
    }

    fn publish(&self) {
        self.updates.send_replace(Arc::new(self.state.clone()));
    }

    /// Disconnects and stops the background context.
    pub async fn shutdown(self) {
        tracing::info!(session_id = %self.session_id, "Session ending");
        self.bridge.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use shared_types::{PatchErrorKind, QueryAck, QueryRequest};

    use crate::transport::{FrameStream, QueryError, TransportError};

    struct NeverConnector;

    #[async_trait]
    impl StreamConnector for NeverConnector {
        async fn connect(&self, _endpoint: &str) -> Result<FrameStream, TransportError> {
            Err(TransportError::Connect("offline".to_string()))
        }
    }

    struct NoopQuery;

    #[async_trait]
    impl QueryClient for NoopQuery {
        async fn send_query(&self, _request: &QueryRequest) -> Result<QueryAck, QueryError> {
            Ok(QueryAck::default())
        }
    }

    async fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::start(DispatcherOptions {
            endpoint: "http://localhost/stream".to_string(),
            config: ConnectionConfig::default(),
            limits: PatchLimits::default(),
            max_frame_bytes: 1024,
            connector: Arc::new(NeverConnector),
            query_client: Arc::new(NoopQuery),
        })
        .await
        .expect("dispatcher")
    }

    fn table_patch(id: &str) -> serde_json::Value {
        json!({
            "op": "append",
            "path": "/children",
            "value": {
                "id": id,
                "type": "Table",
                "data": {"columns": [{"key": "n", "title": "N", "dataType": "number"}], "rows": [{"n": 1}]}
            }
        })
    }

    fn response(patches: Vec<serde_json::Value>, request_id: &str) -> BackgroundMsg {
        BackgroundMsg::AgentResponse(AgentResponse {
            patches: Some(patches),
            message: Some("Response from SQL agent".to_string()),
            request_id: Some(request_id.to_string()),
            raw_message: String::new(),
        })
    }

    fn open_status() -> BackgroundMsg {
        BackgroundMsg::ConnectionStatus(ConnectionStatus {
            is_connected: true,
            phase: ConnectionPhase::Open,
            ..ConnectionStatus::default()
        })
    }

    #[tokio::test]
    async fn test_send_message_rejected_unless_open() {
        let mut dispatcher = dispatcher().await;
        assert_eq!(
            dispatcher.send_message("show sales"),
            Err(DispatchError::NotConnected(ConnectionPhase::Idle))
        );

        dispatcher.handle_message(open_status());
        assert_eq!(dispatcher.send_message("   "), Err(DispatchError::EmptyMessage));
        let request_id = dispatcher.send_message("show sales").expect("accepted");
        assert!(Uuid::parse_str(&request_id).is_ok());
    }

    #[tokio::test]
    async fn test_send_message_rejected_right_after_disconnect() {
        let mut dispatcher = dispatcher().await;
        dispatcher.handle_message(open_status());

        dispatcher.disconnect().expect("disconnect");
        assert_eq!(dispatcher.state().connection.phase, ConnectionPhase::Idle);
        assert!(!dispatcher.state().connection.is_connected);
        assert_eq!(
            dispatcher.send_message("after disconnect"),
            Err(DispatchError::NotConnected(ConnectionPhase::Idle))
        );
    }

    #[tokio::test]
    async fn test_batches_apply_in_order_and_publish() {
        let mut dispatcher = dispatcher().await;
        let mut updates = dispatcher.subscribe();

        dispatcher.handle_message(response(vec![table_patch("a")], "r1"));
        dispatcher.handle_message(response(vec![table_patch("b"), json!({"op": "nope"})], "r2"));

        let state = dispatcher.state();
        let ids: Vec<_> = state.ui_document.children.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(state.ui_document.version, 2);
        assert_eq!(state.ui_document.request_id.as_deref(), Some("r2"));
        assert_eq!(state.patch_errors.len(), 1);
        assert_eq!(state.patch_errors[0].patch_index, 1);
        assert_eq!(state.patch_errors[0].error.kind, PatchErrorKind::UnknownOperation);
        assert_eq!(state.last_message.as_deref(), Some("Response from SQL agent"));

        assert!(updates.has_changed().expect("sender alive"));
        assert_eq!(updates.borrow_and_update().ui_document.len(), 2);
    }

    #[tokio::test]
    async fn test_message_only_response_keeps_document() {
        let mut dispatcher = dispatcher().await;
        dispatcher.handle_message(response(vec![table_patch("a")], "r1"));
        let before = dispatcher.document();

        dispatcher.handle_message(BackgroundMsg::AgentResponse(AgentResponse {
            patches: None,
            message: Some("Connected to SQL Agent".to_string()),
            request_id: None,
            raw_message: String::new(),
        }));
        assert!(Arc::ptr_eq(&before, &dispatcher.document()));
        assert_eq!(dispatcher.state().last_message.as_deref(), Some("Connected to SQL Agent"));
    }

    #[tokio::test]
    async fn test_patch_errors_are_capped_and_clearable() {
        let mut dispatcher = dispatcher().await;
        let bad: Vec<_> = (0..150).map(|_| json!({"op": "remove"})).collect();
        dispatcher.handle_message(response(bad.clone(), "r1"));
        dispatcher.handle_message(response(bad, "r2"));
        assert_eq!(dispatcher.state().patch_errors.len(), MAX_PATCH_ERRORS);

        dispatcher.handle_message(BackgroundMsg::Error {
            message: "Query r3 failed".to_string(),
        });
        assert_eq!(dispatcher.state().last_error.as_deref(), Some("Query r3 failed"));

        dispatcher.clear_errors();
        assert!(dispatcher.state().patch_errors.is_empty());
        assert!(dispatcher.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_status_error_becomes_last_error() {
        let mut dispatcher = dispatcher().await;
        dispatcher.handle_message(BackgroundMsg::ConnectionStatus(ConnectionStatus {
            is_loading: true,
            connection_attempts: 2,
            error: Some("Connect failed: offline".to_string()),
            phase: ConnectionPhase::Reconnecting,
            ..ConnectionStatus::default()
        }));
        assert_eq!(dispatcher.state().connection.phase, ConnectionPhase::Reconnecting);
        assert_eq!(
            dispatcher.state().last_error.as_deref(),
            Some("Connect failed: offline")
        );
    }
}
