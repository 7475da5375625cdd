//! Heartbeat scheduling and quality-driven interval adaptation
//!
//! Pure timing logic: the shell asks "when is the next deadline and what do I
//! do when it fires", feeding clock readings in. Probe liveness uses an ack
//! deadline of 1.6x the probe interval.

use tracing::debug;

use crate::config::AdaptiveConfig;
use crate::types::{QualityLevel, Timestamp};

// ----------------------------------------------------------------------------
// Heartbeat State
// ----------------------------------------------------------------------------

/// What the shell must do when a heartbeat deadline fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a probe and arm the ack deadline
    SendProbe,
    /// No correlated ack arrived in time. Non-fatal: the probe cycle
    /// re-arms and the caller decides what to do with the signal.
    Expired,
}

/// Tracks the probe/ack cycle for a live connection
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    interval_ms: u64,
    /// Deadline of the next probe, or of the pending ack
    deadline: Timestamp,
    awaiting_ack: bool,
    /// `clientSentAt` of the outstanding probe; acks must echo it
    pending_sent_at: Option<u64>,
}

impl HeartbeatState {
    /// Start a fresh cycle: first probe fires one interval from `now`
    pub fn start(interval_ms: u64, now: Timestamp) -> Self {
        Self {
            interval_ms,
            deadline: now.add_millis(interval_ms),
            awaiting_ack: false,
            pending_sent_at: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Next instant the shell must wake up at
    pub fn deadline(&self) -> Timestamp {
        self.deadline
    }

    /// Missing acks past this bound mean the link is dead
    pub fn ack_deadline_ms(&self) -> u64 {
        // 1.6x the interval, integer arithmetic
        self.interval_ms * 16 / 10
    }

    /// The deadline fired; decide whether to probe or report a missed ack.
    /// A miss abandons the outstanding probe and re-arms the cycle, so each
    /// unacknowledged probe yields exactly one `Expired`.
    pub fn on_deadline(&mut self, now: Timestamp) -> HeartbeatAction {
        if self.awaiting_ack {
            debug!(interval_ms = self.interval_ms, "heartbeat ack deadline missed");
            self.awaiting_ack = false;
            self.pending_sent_at = None;
            self.deadline = now.add_millis(self.interval_ms);
            return HeartbeatAction::Expired;
        }
        self.awaiting_ack = true;
        self.deadline = now.add_millis(self.ack_deadline_ms());
        HeartbeatAction::SendProbe
    }

    /// Record the `clientSentAt` the probe went out with
    pub fn probe_sent(&mut self, client_sent_at: u64) {
        self.pending_sent_at = Some(client_sent_at);
    }

    /// An inbound heartbeat arrived; it confirms the outstanding probe only
    /// when its `clientSentAt` echoes the one the probe carried. Returns
    /// whether the probe was confirmed.
    pub fn confirm(&mut self, client_sent_at: Option<u64>, now: Timestamp) -> bool {
        if !self.awaiting_ack {
            return false;
        }
        if client_sent_at != self.pending_sent_at {
            debug!(
                expected = ?self.pending_sent_at,
                received = ?client_sent_at,
                "uncorrelated heartbeat ignored"
            );
            return false;
        }
        self.awaiting_ack = false;
        self.pending_sent_at = None;
        self.deadline = now.add_millis(self.interval_ms);
        true
    }

    /// Apply a new interval; the next probe is rescheduled from `now`
    pub fn set_interval(&mut self, interval_ms: u64, now: Timestamp) {
        self.interval_ms = interval_ms;
        if !self.awaiting_ack {
            self.deadline = now.add_millis(interval_ms);
        }
    }
}

// ----------------------------------------------------------------------------
// Adaptive Interval
// ----------------------------------------------------------------------------

/// Quality-driven heartbeat interval with hysteresis.
///
/// Small interval differences and rapid flapping are absorbed: a change is
/// applied only when it differs from the current interval by more than the
/// configured delta and the cooldown since the last applied change has passed.
#[derive(Debug, Clone)]
pub struct AdaptiveHeartbeat {
    config: AdaptiveConfig,
    current_interval_ms: u64,
    last_change_at: Option<Timestamp>,
}

impl AdaptiveHeartbeat {
    pub fn new(config: AdaptiveConfig, initial_interval_ms: u64) -> Self {
        Self {
            config,
            current_interval_ms: initial_interval_ms,
            last_change_at: None,
        }
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.current_interval_ms
    }

    /// Quality changed; returns the new interval if an adjustment applies
    pub fn on_quality_change(&mut self, level: QualityLevel, now: Timestamp) -> Option<u64> {
        let target = self.config.table.interval_for(level);
        let delta = target.abs_diff(self.current_interval_ms);
        if delta <= self.config.min_change_delta_ms {
            return None;
        }
        if let Some(last) = self.last_change_at {
            if now.millis_since(last) < self.config.cooldown_ms {
                debug!(
                    quality = level.name(),
                    target_ms = target,
                    "heartbeat adjustment suppressed by cooldown"
                );
                return None;
            }
        }
        debug!(
            quality = level.name(),
            from_ms = self.current_interval_ms,
            to_ms = target,
            "heartbeat interval adjusted"
        );
        self.current_interval_ms = target;
        self.last_change_at = Some(now);
        Some(target)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
