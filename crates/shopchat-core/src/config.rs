//! Configuration for the shopchat delivery subsystem

use serde::{Deserialize, Serialize};

use crate::types::QualityLevel;

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for the connection lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Base reconnect delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on the reconnect delay
    pub max_delay_ms: u64,
    /// Reconnect attempts before the connection becomes terminally `Failed`
    pub max_reconnect_attempts: u32,
    /// Whether the manager runs its own heartbeat loop while connected
    pub enable_auto_heartbeat: bool,
    /// Heartbeat probe interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Adaptive heartbeat tuning; `None` disables quality-driven adjustment
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            enable_auto_heartbeat: true,
            heartbeat_interval_ms: 25_000,
            adaptive: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Adaptive Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Quality-level to heartbeat-interval mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIntervalTable {
    pub excellent_ms: u64,
    pub good_ms: u64,
    pub fair_ms: u64,
    pub poor_ms: u64,
    pub critical_ms: u64,
}

impl QualityIntervalTable {
    /// Target heartbeat interval for a quality level
    pub fn interval_for(&self, level: QualityLevel) -> u64 {
        match level {
            QualityLevel::Excellent => self.excellent_ms,
            QualityLevel::Good => self.good_ms,
            QualityLevel::Fair => self.fair_ms,
            QualityLevel::Poor => self.poor_ms,
            QualityLevel::Critical => self.critical_ms,
        }
    }
}

impl Default for QualityIntervalTable {
    fn default() -> Self {
        Self {
            excellent_ms: 40_000,
            good_ms: 30_000,
            fair_ms: 20_000,
            poor_ms: 10_000,
            critical_ms: 5_000,
        }
    }
}

/// Hysteresis settings for quality-driven heartbeat adjustment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Interval table keyed by quality level
    pub table: QualityIntervalTable,
    /// Minimum interval difference before a change is applied
    pub min_change_delta_ms: u64,
    /// Minimum time between two applied adjustments
    pub cooldown_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            table: QualityIntervalTable::default(),
            min_change_delta_ms: 5_000,
            cooldown_ms: 30_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Send Configuration
// ----------------------------------------------------------------------------

/// Configuration for the outbound send channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    /// Retries per queue item before it fails terminally
    pub max_retries: u32,
    /// Base retry delay; attempt N waits `base * 2^(N-1)`
    pub base_retry_delay_ms: u64,
    /// Optional cap on the retry delay; unbounded when `None`
    pub max_retry_delay_ms: Option<u64>,
    /// Characters of text content contributing to the dedup fingerprint
    pub fingerprint_content_chars: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 800,
            max_retry_delay_ms: None,
            fingerprint_content_chars: 32,
        }
    }
}

impl SendConfig {
    /// Delay before the Nth retry (`retry_count` starts at 1)
    pub fn retry_delay_ms(&self, retry_count: u32) -> u64 {
        let exp = retry_count.saturating_sub(1).min(63);
        let delay = self
            .base_retry_delay_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        match self.max_retry_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

// ----------------------------------------------------------------------------
// Processor Configuration
// ----------------------------------------------------------------------------

/// Configuration for the inbound message processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Wrap unparseable strings as `text` envelopes instead of erroring
    pub allow_plain_text: bool,
    /// Run per-type validators during parsing
    pub enable_validation: bool,
    /// Keep a bounded ring of processed envelopes
    pub enable_history: bool,
    /// History ring capacity, oldest evicted first
    pub max_history_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            allow_plain_text: true,
            enable_validation: true,
            enable_history: true,
            max_history_size: 50,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
