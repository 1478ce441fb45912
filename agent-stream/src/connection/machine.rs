//! Connection state machine.
//!
//! Transitions are pure: `ConnectionState::step` maps (state, event) to a new
//! state plus the effects the owner must carry out. Nothing here touches a
//! socket or a timer, so backoff and heartbeat behavior are testable without a
//! live transport.

use std::time::Duration;

use shared_types::{ConnectionConfig, ConnectionPhase, ConnectionStatus};

/// Upper bound on any single reconnect delay.
pub const RECONNECT_CAP: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th consecutive reconnect (1-based):
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ReconnectPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_interval),
            cap: RECONNECT_CAP,
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Explicit connect request; only honored from `Idle`.
    Connect,
    /// Explicit reconnect request; valid from any state.
    Reconnect,
    Opened { generation: u64 },
    TransportError { generation: u64, error: String },
    HeartbeatTick { ready: bool },
    ReconnectTimerFired,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { generation: u64 },
    CloseTransport,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
    EmitStatus(ConnectionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub session_id: String,
    /// Identifies the live transport instance; bumped on every open.
    pub generation: u64,
    pub policy: ReconnectPolicy,
}

impl ConnectionState {
    pub fn new(session_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            attempt: 0,
            last_error: None,
            session_id: session_id.into(),
            generation: 0,
            policy,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            is_connected: self.phase == ConnectionPhase::Open,
            is_loading: matches!(
                self.phase,
                ConnectionPhase::Connecting | ConnectionPhase::Reconnecting
            ),
            connection_attempts: self.attempt,
            error: self.last_error.clone(),
            phase: self.phase,
        }
    }

    pub fn step(&self, event: ConnectionEvent) -> (ConnectionState, Vec<Effect>) {
        let mut next = self.clone();
        let mut effects = Vec::new();

        match event {
            ConnectionEvent::Connect => {
                if next.phase == ConnectionPhase::Idle {
                    next.attempt = 1;
                    next.last_error = None;
                    next.open(&mut effects);
                }
            }
            ConnectionEvent::Reconnect => {
                effects.extend([
                    Effect::CancelReconnect,
                    Effect::StopHeartbeat,
                    Effect::CloseTransport,
                ]);
                next.attempt = 0;
                next.last_error = None;
                next.open(&mut effects);
            }
            ConnectionEvent::Opened { generation } => {
                if generation == next.generation && next.phase == ConnectionPhase::Connecting {
                    next.phase = ConnectionPhase::Open;
                    next.attempt = 0;
                    next.last_error = None;
                    effects.push(Effect::StartHeartbeat);
                    effects.push(Effect::EmitStatus(next.status()));
                }
            }
            ConnectionEvent::TransportError { generation, error } => {
                let live = matches!(
                    next.phase,
                    ConnectionPhase::Connecting | ConnectionPhase::Open | ConnectionPhase::Degraded
                );
                if generation == next.generation && live {
                    next.enter_reconnecting(error, &mut effects);
                }
            }
            ConnectionEvent::HeartbeatTick { ready } => {
                if next.phase == ConnectionPhase::Open && !ready {
                    next.phase = ConnectionPhase::Degraded;
                    next.last_error = Some("heartbeat missed: transport not ready".to_string());
                    effects.push(Effect::EmitStatus(next.status()));
                    next.enter_reconnecting("heartbeat missed: transport not ready".to_string(), &mut effects);
                }
            }
            ConnectionEvent::ReconnectTimerFired => {
                if next.phase == ConnectionPhase::Reconnecting {
                    next.open(&mut effects);
                }
            }
            ConnectionEvent::Disconnect => {
                effects.extend([
                    Effect::CancelReconnect,
                    Effect::StopHeartbeat,
                    Effect::CloseTransport,
                ]);
                let was_idle = next.phase == ConnectionPhase::Idle;
                next.phase = ConnectionPhase::Idle;
                next.attempt = 0;
                next.last_error = None;
                if !was_idle {
                    effects.push(Effect::EmitStatus(next.status()));
                }
            }
        }

        (next, effects)
    }

    fn open(&mut self, effects: &mut Vec<Effect>) {
        self.generation += 1;
        self.phase = ConnectionPhase::Connecting;
        effects.push(Effect::OpenTransport {
            generation: self.generation,
        });
        effects.push(Effect::EmitStatus(self.status()));
    }

    fn enter_reconnecting(&mut self, error: String, effects: &mut Vec<Effect>) {
        effects.push(Effect::StopHeartbeat);
        effects.push(Effect::CloseTransport);
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(error);
        if self.attempt > self.policy.max_attempts {
            self.phase = ConnectionPhase::Failed;
        } else {
            self.phase = ConnectionPhase::Reconnecting;
            effects.push(Effect::ScheduleReconnect {
                delay: self.policy.delay_for(self.attempt),
            });
        }
        effects.push(Effect::EmitStatus(self.status()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(3_000),
            cap: RECONNECT_CAP,
            max_attempts: 5,
        }
    }

    fn run(state: &mut ConnectionState, event: ConnectionEvent) -> Vec<Effect> {
        let (next, effects) = state.step(event);
        *state = next;
        effects
    }

    fn open_state() -> ConnectionState {
        let mut state = ConnectionState::new("session-1", policy());
        run(&mut state, ConnectionEvent::Connect);
        let generation = state.generation;
        run(&mut state, ConnectionEvent::Opened { generation });
        assert_eq!(state.phase, ConnectionPhase::Open);
        state
    }

    fn fail(state: &mut ConnectionState) -> Vec<Effect> {
        let generation = state.generation;
        run(
            state,
            ConnectionEvent::TransportError {
                generation,
                error: "connection reset".to_string(),
            },
        )
    }

    fn scheduled_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect { delay } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn test_delay_sequence_is_capped_exponential() {
        let policy = policy();
        let delays: Vec<u128> = (1..=7).map(|k| policy.delay_for(k).as_millis()).collect();
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 30_000, 30_000, 30_000]);
        assert_eq!(policy.delay_for(64), RECONNECT_CAP);
    }

    #[test]
    fn test_connect_from_idle() {
        let mut state = ConnectionState::new("session-1", policy());
        let effects = run(&mut state, ConnectionEvent::Connect);

        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert_eq!(state.attempt, 1);
        assert_eq!(effects[0], Effect::OpenTransport { generation: 1 });
        let Effect::EmitStatus(status) = &effects[1] else {
            panic!("expected status");
        };
        assert!(status.is_loading);
        assert!(!status.is_connected);
    }

    #[test]
    fn test_connect_ignored_when_active() {
        let mut state = open_state();
        let effects = run(&mut state, ConnectionEvent::Connect);
        assert!(effects.is_empty());
        assert_eq!(state.phase, ConnectionPhase::Open);
    }

    #[test]
    fn test_opened_resets_attempt_and_starts_heartbeat() {
        let mut state = ConnectionState::new("session-1", policy());
        run(&mut state, ConnectionEvent::Connect);
        let effects = run(&mut state, ConnectionEvent::Opened { generation: 1 });

        assert_eq!(state.attempt, 0);
        assert_eq!(effects[0], Effect::StartHeartbeat);
        let Effect::EmitStatus(status) = &effects[1] else {
            panic!("expected status");
        };
        assert!(status.is_connected);
        assert_eq!(status.phase, ConnectionPhase::Open);
    }

    #[test]
    fn test_error_before_open_goes_to_reconnecting() {
        let mut state = ConnectionState::new("session-1", policy());
        run(&mut state, ConnectionEvent::Connect);
        let effects = fail(&mut state);

        assert_eq!(state.phase, ConnectionPhase::Reconnecting);
        // the initial connect counted as attempt 1
        assert_eq!(state.attempt, 2);
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_millis(6_000)));
        assert!(effects.contains(&Effect::CloseTransport));
    }

    #[test]
    fn test_consecutive_failures_follow_backoff_then_fail() {
        let mut state = open_state();
        let mut delays = Vec::new();

        for _ in 0..5 {
            let effects = fail(&mut state);
            assert_eq!(state.phase, ConnectionPhase::Reconnecting);
            delays.push(scheduled_delay(&effects).expect("timer scheduled").as_millis());
            let effects = run(&mut state, ConnectionEvent::ReconnectTimerFired);
            assert_eq!(state.phase, ConnectionPhase::Connecting);
            assert!(matches!(effects[0], Effect::OpenTransport { .. }));
        }
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 30_000]);

        let effects = fail(&mut state);
        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert_eq!(state.attempt, 6);
        assert_eq!(scheduled_delay(&effects), None);
        let Some(Effect::EmitStatus(status)) = effects.last() else {
            panic!("expected status");
        };
        assert_eq!(status.phase, ConnectionPhase::Failed);
        assert_eq!(status.error.as_deref(), Some("connection reset"));

        // terminal: timers and errors do nothing
        assert!(run(&mut state, ConnectionEvent::ReconnectTimerFired).is_empty());
        assert!(fail(&mut state).is_empty());
        assert_eq!(state.phase, ConnectionPhase::Failed);
    }

    #[test]
    fn test_explicit_reconnect_leaves_failed() {
        let mut state = ConnectionState::new("session-1", ReconnectPolicy {
            max_attempts: 0,
            ..policy()
        });
        run(&mut state, ConnectionEvent::Connect);
        fail(&mut state);
        assert_eq!(state.phase, ConnectionPhase::Failed);

        let before = state.generation;
        let effects = run(&mut state, ConnectionEvent::Reconnect);
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert_eq!(state.attempt, 0);
        assert_eq!(state.last_error, None);
        assert!(effects.contains(&Effect::OpenTransport {
            generation: before + 1
        }));
    }

    #[test]
    fn test_heartbeat_miss_degrades_then_reconnects() {
        let mut state = open_state();
        assert!(run(&mut state, ConnectionEvent::HeartbeatTick { ready: true }).is_empty());

        let effects = run(&mut state, ConnectionEvent::HeartbeatTick { ready: false });
        let phases: Vec<ConnectionPhase> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::EmitStatus(s) => Some(s.phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![ConnectionPhase::Degraded, ConnectionPhase::Reconnecting]);
        assert_eq!(state.phase, ConnectionPhase::Reconnecting);
        assert_eq!(state.attempt, 1);
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_millis(3_000)));
        assert!(effects.contains(&Effect::StopHeartbeat));
    }

    #[test]
    fn test_stale_generation_events_are_ignored() {
        let mut state = open_state();
        fail(&mut state);
        run(&mut state, ConnectionEvent::ReconnectTimerFired);
        assert_eq!(state.generation, 2);

        assert!(run(&mut state, ConnectionEvent::Opened { generation: 1 }).is_empty());
        assert!(run(
            &mut state,
            ConnectionEvent::TransportError {
                generation: 1,
                error: "late".to_string()
            }
        )
        .is_empty());
        assert_eq!(state.phase, ConnectionPhase::Connecting);
    }

    #[test]
    fn test_disconnect_clears_everything_and_late_timer_is_inert() {
        let mut state = open_state();
        fail(&mut state);
        assert_eq!(state.phase, ConnectionPhase::Reconnecting);

        let effects = run(&mut state, ConnectionEvent::Disconnect);
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(effects.contains(&Effect::StopHeartbeat));
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert_eq!(state.attempt, 0);

        assert!(run(&mut state, ConnectionEvent::ReconnectTimerFired).is_empty());
        assert!(run(&mut state, ConnectionEvent::HeartbeatTick { ready: false }).is_empty());
        assert_eq!(state.phase, ConnectionPhase::Idle);
    }

    #[test]
    fn test_session_id_survives_reconnects() {
        let mut state = open_state();
        fail(&mut state);
        run(&mut state, ConnectionEvent::ReconnectTimerFired);
        run(&mut state, ConnectionEvent::Reconnect);
        assert_eq!(state.session_id, "session-1");
    }

    #[test]
    fn test_policy_from_config() {
        let config = ConnectionConfig {
            reconnect_interval: 100,
            max_reconnect_attempts: 2,
            ..ConnectionConfig::default()
        };
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.base, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
