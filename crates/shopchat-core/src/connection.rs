//! Connection lifecycle state machine
//!
//! Pure state machine for a single logical connection. Each input returns the
//! list of effects the async shell must execute (open/close the transport,
//! arm or cancel timers, emit events), keeping reconnection mechanics fully
//! deterministic and testable without a runtime.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::events::ConnectionSignal;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Lifecycle state of the managed connection; exactly one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and none in progress
    Disconnected,
    /// Transport open in flight
    Connecting,
    /// Transport open and usable
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Retry budget exhausted; terminal until reset
    Failed,
    /// Explicit disconnect in progress
    Closing,
}

impl ConnectionState {
    /// State name for logging and events
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closing => "closing",
        }
    }
}

/// Read-only snapshot of the connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_connected_at: None,
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Effects
// ----------------------------------------------------------------------------

/// Effects the async shell executes after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEffect {
    /// Begin a transport open attempt
    OpenTransport,
    /// Close the transport
    CloseTransport,
    /// Arm the reconnect timer for the given attempt
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Disarm any pending reconnect timer
    CancelReconnect,
    /// Start the heartbeat loop
    StartHeartbeat,
    /// Stop the heartbeat loop
    StopHeartbeat,
    /// Publish a signal on the event bus
    Emit(ConnectionSignal),
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Delay before reconnect attempt N: `min(base · 2^(N-1), max)`, no jitter
pub fn reconnect_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let raw = config
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
    Duration::from_millis(raw.min(config.max_delay_ms))
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Drives `ConnectionInfo` through the lifecycle in response to inputs
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    config: ConnectionConfig,
    info: ConnectionInfo,
}

impl ConnectionMachine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            info: ConnectionInfo::default(),
        }
    }

    /// Current snapshot
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.info.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn set_state(
        &mut self,
        new_state: ConnectionState,
        error: Option<String>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        let old_state = self.info.state;
        if old_state == new_state {
            return;
        }
        self.info.state = new_state;
        self.info.last_error = error.clone();
        debug!(from = old_state.name(), to = new_state.name(), "connection state changed");
        effects.push(ConnectionEffect::Emit(ConnectionSignal::StateChanged {
            old_state,
            new_state,
            error,
        }));
    }

    /// `connect()` request; idempotent while Connecting/Connected
    pub fn connect(&mut self) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        match self.info.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Failed => {
                warn!("connect() ignored: connection is terminally failed, reset first");
            }
            _ => {
                self.set_state(ConnectionState::Connecting, None, &mut effects);
                effects.push(ConnectionEffect::Emit(ConnectionSignal::Connecting));
                effects.push(ConnectionEffect::OpenTransport);
            }
        }
        effects
    }

    /// Transport reported open
    pub fn transport_opened(&mut self, now: Timestamp) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.info.state != ConnectionState::Connecting {
            debug!(state = self.info.state.name(), "ignoring open in current state");
            return effects;
        }
        self.info.reconnect_attempts = 0;
        self.info.last_connected_at = Some(now);
        self.set_state(ConnectionState::Connected, None, &mut effects);
        effects.push(ConnectionEffect::Emit(ConnectionSignal::Open));
        if self.config.enable_auto_heartbeat {
            effects.push(ConnectionEffect::StartHeartbeat);
        }
        effects
    }

    /// Transport reported close or error
    pub fn transport_closed(&mut self, reason: impl Into<String>) -> Vec<ConnectionEffect> {
        let reason = reason.into();
        let mut effects = Vec::new();
        match self.info.state {
            ConnectionState::Closing => {
                self.set_state(ConnectionState::Disconnected, None, &mut effects);
                effects.push(ConnectionEffect::Emit(ConnectionSignal::Close));
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                effects.push(ConnectionEffect::StopHeartbeat);
                effects.extend(self.schedule_reconnect(reason));
            }
            _ => {
                debug!(state = self.info.state.name(), %reason, "close ignored");
            }
        }
        effects
    }

    /// Arm the next reconnect attempt, or fail terminally past the budget.
    ///
    /// Attempts increment before each scheduled attempt and are capped by
    /// `max_reconnect_attempts`.
    pub fn schedule_reconnect(&mut self, reason: impl Into<String>) -> Vec<ConnectionEffect> {
        let reason = reason.into();
        let mut effects = Vec::new();

        if self.info.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(%reason, "reconnect budget exhausted, failing terminally");
            self.set_state(
                ConnectionState::Failed,
                Some("reconnect attempts exhausted".to_string()),
                &mut effects,
            );
            effects.push(ConnectionEffect::CancelReconnect);
            effects.push(ConnectionEffect::Emit(ConnectionSignal::Failed {
                reason: "reconnect attempts exhausted".to_string(),
            }));
            return effects;
        }

        self.info.reconnect_attempts += 1;
        let attempt = self.info.reconnect_attempts;
        let delay = reconnect_delay(&self.config, attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, %reason, "scheduling reconnect");

        self.set_state(ConnectionState::Reconnecting, Some(reason), &mut effects);
        effects.push(ConnectionEffect::Emit(ConnectionSignal::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        }));
        effects.push(ConnectionEffect::ScheduleReconnect { attempt, delay });
        effects
    }

    /// Backoff timer fired; start the next attempt
    pub fn backoff_elapsed(&mut self) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.info.state != ConnectionState::Reconnecting {
            return effects;
        }
        self.set_state(ConnectionState::Connecting, None, &mut effects);
        effects.push(ConnectionEffect::Emit(ConnectionSignal::Connecting));
        effects.push(ConnectionEffect::OpenTransport);
        effects
    }

    /// `disconnect()` request; cancels all pending timers
    pub fn disconnect(&mut self) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        match self.info.state {
            ConnectionState::Disconnected | ConnectionState::Closing => {}
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.set_state(ConnectionState::Closing, None, &mut effects);
                effects.push(ConnectionEffect::StopHeartbeat);
                effects.push(ConnectionEffect::CancelReconnect);
                effects.push(ConnectionEffect::CloseTransport);
            }
            ConnectionState::Reconnecting | ConnectionState::Failed => {
                // No live transport; drop straight to Disconnected
                effects.push(ConnectionEffect::StopHeartbeat);
                effects.push(ConnectionEffect::CancelReconnect);
                self.set_state(ConnectionState::Disconnected, None, &mut effects);
                effects.push(ConnectionEffect::Emit(ConnectionSignal::Close));
            }
        }
        effects
    }

    /// Manual reset out of the terminal `Failed` state
    pub fn reset_failure(&mut self) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.info.state == ConnectionState::Failed {
            self.info.reconnect_attempts = 0;
            self.set_state(ConnectionState::Disconnected, None, &mut effects);
        }
        effects
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionMachine {
        ConnectionMachine::new(ConnectionConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: max_attempts,
            enable_auto_heartbeat: false,
            ..ConnectionConfig::default()
        })
    }

    fn scheduled_delay(effects: &[ConnectionEffect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            ConnectionEffect::ScheduleReconnect { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn test_connect_opens_transport() {
        let mut m = machine(3);
        let effects = m.connect();
        assert!(effects.contains(&ConnectionEffect::OpenTransport));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_idempotent() {
        let mut m = machine(3);
        m.connect();
        assert!(m.connect().is_empty());
        m.transport_opened(Timestamp::new(1));
        assert!(m.connect().is_empty());
    }

    #[test]
    fn test_open_records_info_and_resets_attempts() {
        let mut m = machine(3);
        m.connect();
        m.transport_closed("io error");
        assert_eq!(m.info().reconnect_attempts, 1);

        m.backoff_elapsed();
        let effects = m.transport_opened(Timestamp::new(42));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.info().reconnect_attempts, 0);
        assert_eq!(m.info().last_connected_at, Some(Timestamp::new(42)));
        assert!(effects.contains(&ConnectionEffect::Emit(ConnectionSignal::Open)));
    }

    #[test]
    fn test_auto_heartbeat_effect() {
        let mut m = ConnectionMachine::new(ConnectionConfig {
            enable_auto_heartbeat: true,
            ..ConnectionConfig::default()
        });
        m.connect();
        let effects = m.transport_opened(Timestamp::new(1));
        assert!(effects.contains(&ConnectionEffect::StartHeartbeat));
    }

    #[test]
    fn test_backoff_sequence_then_failed() {
        let mut m = machine(3);
        m.connect();

        let mut delays = Vec::new();
        for _ in 0..3 {
            let effects = m.transport_closed("connection lost");
            delays.push(scheduled_delay(&effects).unwrap().as_millis() as u64);
            m.backoff_elapsed();
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);

        // Fourth failure exceeds the budget
        let effects = m.transport_closed("connection lost");
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(effects
            .iter()
            .any(|e| matches!(e, ConnectionEffect::Emit(ConnectionSignal::Failed { .. }))));

        // Terminal until reset
        assert!(m.connect().is_empty());
        m.reset_failure();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.connect().is_empty());
    }

    #[test]
    fn test_backoff_formula_capped() {
        let config = ConnectionConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            ..ConnectionConfig::default()
        };
        for (attempt, expected) in [(1, 1_000), (2, 2_000), (5, 16_000), (6, 30_000), (10, 30_000)]
        {
            assert_eq!(
                reconnect_delay(&config, attempt),
                Duration::from_millis(expected),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_disconnect_closes_then_disconnects() {
        let mut m = machine(3);
        m.connect();
        m.transport_opened(Timestamp::new(1));

        let effects = m.disconnect();
        assert_eq!(m.state(), ConnectionState::Closing);
        assert!(effects.contains(&ConnectionEffect::CloseTransport));
        assert!(effects.contains(&ConnectionEffect::CancelReconnect));

        let effects = m.transport_closed("client close");
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(effects.contains(&ConnectionEffect::Emit(ConnectionSignal::Close)));
    }

    #[test]
    fn test_disconnect_while_reconnecting() {
        let mut m = machine(3);
        m.connect();
        m.transport_closed("lost");
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        let effects = m.disconnect();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(effects.contains(&ConnectionEffect::CancelReconnect));
    }

    #[test]
    fn test_close_while_disconnected_ignored() {
        let mut m = machine(3);
        assert!(m.transport_closed("spurious").is_empty());
    }
}
