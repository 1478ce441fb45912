//! ConnectionActor - background owner of the streaming connection.
//!
//! Drives `ConnectionState` and carries out its effects. The transport reader,
//! heartbeat ticker and reconnect timer are tokio tasks held in actor state;
//! they only talk to the actor by casting messages tagged with the transport
//! generation they belong to, so anything from a superseded transport is
//! discarded. Nothing in here ever sees the UI document.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{
    BackgroundMsg, ConnectionConfig, ConnectionPhase, ForegroundMsg, LogLevel, QueryRequest,
};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::machine::{ConnectionEvent, ConnectionState, Effect, ReconnectPolicy};
use crate::bridge::frame::{classify_frame, FrameOutcome};
use crate::transport::{QueryClient, StreamConnector, TransportError};

pub struct ConnectionArguments {
    pub session_id: String,
    pub connector: Arc<dyn StreamConnector>,
    pub query_client: Arc<dyn QueryClient>,
    pub outbound: mpsc::UnboundedSender<BackgroundMsg>,
    pub max_frame_bytes: usize,
}

pub struct ConnectionActorState {
    machine: ConnectionState,
    endpoint: Option<String>,
    config: ConnectionConfig,
    connector: Arc<dyn StreamConnector>,
    query_client: Arc<dyn QueryClient>,
    outbound: mpsc::UnboundedSender<BackgroundMsg>,
    max_frame_bytes: usize,
    transport: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// In-flight side-channel queries.
    queries: JoinSet<()>,
    last_frame_at: Instant,
}

impl ConnectionActorState {
    fn send(&self, msg: BackgroundMsg) {
        // The foreground may already be gone during teardown.
        let _ = self.outbound.send(msg);
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(session_id = %self.machine.session_id, "{message}"),
            LogLevel::Info => tracing::info!(session_id = %self.machine.session_id, "{message}"),
            LogLevel::Warn => tracing::warn!(session_id = %self.machine.session_id, "{message}"),
            LogLevel::Error => tracing::error!(session_id = %self.machine.session_id, "{message}"),
        }
        self.send(BackgroundMsg::Log { message, level });
    }

    fn transport_ready(&self) -> bool {
        let alive = self
            .transport
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        alive && self.last_frame_at.elapsed() <= Duration::from_millis(self.config.timeout)
    }

    fn clear_tasks(&mut self) {
        for task in [
            self.transport.take(),
            self.heartbeat.take(),
            self.reconnect_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.queries.abort_all();
    }
}

#[derive(Debug)]
pub enum ConnectionMsg {
    Command(ForegroundMsg),
    TransportOpened { generation: u64 },
    TransportFrame { generation: u64, data: String },
    TransportFailed { generation: u64, error: String },
    HeartbeatTick { generation: u64 },
    ReconnectDue { generation: u64 },
    GetState { reply: RpcReplyPort<ConnectionState> },
}

#[derive(Debug, Default)]
pub struct ConnectionActor;

#[async_trait]
impl Actor for ConnectionActor {
    type Msg = ConnectionMsg;
    type State = ConnectionActorState;
    type Arguments = ConnectionArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = ConnectionConfig::default();
        Ok(ConnectionActorState {
            machine: ConnectionState::new(args.session_id, ReconnectPolicy::from(&config)),
            endpoint: None,
            config,
            connector: args.connector,
            query_client: args.query_client,
            outbound: args.outbound,
            max_frame_bytes: args.max_frame_bytes,
            transport: None,
            heartbeat: None,
            reconnect_timer: None,
            queries: JoinSet::new(),
            last_frame_at: Instant::now(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConnectionMsg::Command(command) => self.handle_command(&myself, command, state),
            ConnectionMsg::TransportOpened { generation } => {
                state.last_frame_at = Instant::now();
                self.dispatch(&myself, state, ConnectionEvent::Opened { generation });
            }
            ConnectionMsg::TransportFrame { generation, data } => {
                self.handle_frame(state, generation, data);
            }
            ConnectionMsg::TransportFailed { generation, error } => {
                if generation == state.machine.generation {
                    state.log(LogLevel::Warn, format!("Transport {generation} failed: {error}"));
                }
                self.dispatch(
                    &myself,
                    state,
                    ConnectionEvent::TransportError { generation, error },
                );
            }
            ConnectionMsg::HeartbeatTick { generation } => {
                if generation == state.machine.generation {
                    let ready = state.transport_ready();
                    self.dispatch(&myself, state, ConnectionEvent::HeartbeatTick { ready });
                }
            }
            ConnectionMsg::ReconnectDue { generation } => {
                if generation == state.machine.generation {
                    state.reconnect_timer = None;
                    self.dispatch(&myself, state, ConnectionEvent::ReconnectTimerFired);
                }
            }
            ConnectionMsg::GetState { reply } => {
                let _ = reply.send(state.machine.clone());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.clear_tasks();
        tracing::debug!(session_id = %state.machine.session_id, "Connection actor stopped");
        Ok(())
    }
}

impl ConnectionActor {
    fn handle_command(
        &self,
        myself: &ActorRef<ConnectionMsg>,
        command: ForegroundMsg,
        state: &mut ConnectionActorState,
    ) {
        match command {
            ForegroundMsg::Connect { endpoint, config } => {
                state.machine.policy = ReconnectPolicy::from(&config);
                state.endpoint = Some(endpoint);
                state.config = config;
                let event = if state.machine.phase == ConnectionPhase::Idle {
                    ConnectionEvent::Connect
                } else {
                    ConnectionEvent::Reconnect
                };
                self.dispatch(myself, state, event);
            }
            ForegroundMsg::Disconnect => {
                state.queries.abort_all();
                self.dispatch(myself, state, ConnectionEvent::Disconnect);
            }
            ForegroundMsg::SendQuery {
                message,
                request_id,
                session_id,
            } => {
                if state.machine.phase != ConnectionPhase::Open {
                    tracing::warn!(
                        request_id = %request_id,
                        phase = %state.machine.phase,
                        "Dropping query on a connection that is not open"
                    );
                    state.send(BackgroundMsg::Error {
                        message: format!(
                            "Query {request_id} not sent: connection is {}",
                            state.machine.phase
                        ),
                    });
                    return;
                }
                // Reap finished queries so the set only holds live ones.
                while state.queries.try_join_next().is_some() {}

                let request = QueryRequest {
                    message,
                    request_id,
                    session_id,
                };
                let client = state.query_client.clone();
                let outbound = state.outbound.clone();
                state.queries.spawn(async move {
                    match client.send_query(&request).await {
                        Ok(ack) => {
                            tracing::debug!(
                                request_id = %request.request_id,
                                status = ?ack.status,
                                "Query accepted"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(request_id = %request.request_id, error = %e, "Query failed");
                            let _ = outbound.send(BackgroundMsg::Error {
                                message: format!("Query {} failed: {e}", request.request_id),
                            });
                        }
                    }
                });
            }
        }
    }

    fn handle_frame(&self, state: &mut ConnectionActorState, generation: u64, data: String) {
        let live = matches!(
            state.machine.phase,
            ConnectionPhase::Open | ConnectionPhase::Degraded
        );
        if generation != state.machine.generation || !live {
            tracing::trace!(generation, "Discarding frame from superseded transport");
            return;
        }
        state.last_frame_at = Instant::now();

        match classify_frame(&data, state.max_frame_bytes) {
            FrameOutcome::Empty => tracing::trace!("Ignoring empty frame"),
            FrameOutcome::Heartbeat => tracing::trace!("Server heartbeat"),
            FrameOutcome::Response(response) => {
                state.send(BackgroundMsg::AgentResponse(response));
            }
            FrameOutcome::Dropped { level, reason } => {
                state.log(level, format!("Dropped frame: {reason}"));
            }
        }
    }

    fn dispatch(
        &self,
        myself: &ActorRef<ConnectionMsg>,
        state: &mut ConnectionActorState,
        event: ConnectionEvent,
    ) {
        let (next, effects) = state.machine.step(event);
        if next.phase != state.machine.phase {
            tracing::info!(
                session_id = %next.session_id,
                from = %state.machine.phase,
                to = %next.phase,
                attempt = next.attempt,
                generation = next.generation,
                "Connection phase changed"
            );
        }
        state.machine = next;
        for effect in effects {
            self.execute(myself, state, effect);
        }
    }

    fn execute(
        &self,
        myself: &ActorRef<ConnectionMsg>,
        state: &mut ConnectionActorState,
        effect: Effect,
    ) {
        match effect {
            Effect::OpenTransport { generation } => {
                let Some(endpoint) = state.endpoint.clone() else {
                    state.log(LogLevel::Error, "Cannot open transport without an endpoint".to_string());
                    return;
                };
                if let Some(old) = state.transport.take() {
                    old.abort();
                }
                state.transport = Some(spawn_transport(
                    myself.clone(),
                    state.connector.clone(),
                    endpoint,
                    generation,
                    state.config.timeout,
                ));
            }
            Effect::CloseTransport => {
                if let Some(task) = state.transport.take() {
                    task.abort();
                }
            }
            Effect::StartHeartbeat => {
                if let Some(old) = state.heartbeat.take() {
                    old.abort();
                }
                let period = Duration::from_millis(state.config.heartbeat_interval.max(1));
                let generation = state.machine.generation;
                let actor = myself.clone();
                state.heartbeat = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    loop {
                        ticker.tick().await;
                        if actor.cast(ConnectionMsg::HeartbeatTick { generation }).is_err() {
                            break;
                        }
                    }
                }));
            }
            Effect::StopHeartbeat => {
                if let Some(task) = state.heartbeat.take() {
                    task.abort();
                }
            }
            Effect::ScheduleReconnect { delay } => {
                if let Some(old) = state.reconnect_timer.take() {
                    old.abort();
                }
                tracing::info!(
                    attempt = state.machine.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                let generation = state.machine.generation;
                let actor = myself.clone();
                state.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = actor.cast(ConnectionMsg::ReconnectDue { generation });
                }));
            }
            Effect::CancelReconnect => {
                if let Some(task) = state.reconnect_timer.take() {
                    task.abort();
                }
            }
            Effect::EmitStatus(status) => {
                state.send(BackgroundMsg::ConnectionStatus(status));
            }
        }
    }
}

fn spawn_transport(
    actor: ActorRef<ConnectionMsg>,
    connector: Arc<dyn StreamConnector>,
    endpoint: String,
    generation: u64,
    timeout_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let opened =
            tokio::time::timeout(Duration::from_millis(timeout_ms), connector.connect(&endpoint)).await;
        let mut frames = match opened {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => {
                let _ = actor.cast(ConnectionMsg::TransportFailed {
                    generation,
                    error: e.to_string(),
                });
                return;
            }
            Err(_) => {
                let _ = actor.cast(ConnectionMsg::TransportFailed {
                    generation,
                    error: TransportError::Timeout(timeout_ms).to_string(),
                });
                return;
            }
        };

        if actor.cast(ConnectionMsg::TransportOpened { generation }).is_err() {
            return;
        }
        tracing::debug!(generation, endpoint = %endpoint, "Transport opened");

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(data) => {
                    if actor
                        .cast(ConnectionMsg::TransportFrame { generation, data })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    let _ = actor.cast(ConnectionMsg::TransportFailed {
                        generation,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }

        let _ = actor.cast(ConnectionMsg::TransportFailed {
            generation,
            error: "stream closed by server".to_string(),
        });
    })
}
