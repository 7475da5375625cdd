//! Event vocabulary and bus seam
//!
//! Every externally observable transition is published as a `BusEvent`; UI
//! collaborators subscribe through an [`EventBus`] implementation and never
//! reach into component state directly.

use serde_json::Value;

use crate::connection::ConnectionState;
use crate::errors::SendErrorCode;
use crate::types::QueueId;

// ----------------------------------------------------------------------------
// Connection Signals
// ----------------------------------------------------------------------------

/// Signals emitted by the connection state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    StateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        error: Option<String>,
    },
    Connecting,
    Open,
    Close,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Failed { reason: String },
}

// ----------------------------------------------------------------------------
// Bus Events
// ----------------------------------------------------------------------------

/// Externally observable events, one variant per wire event name
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Connecting,
    Open,
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Failed {
        reason: String,
    },
    Close,
    StateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        error: Option<String>,
    },
    HeartbeatSent {
        sent_at_ms: u64,
    },
    HeartbeatLost,
    AdaptiveHeartbeatChanged {
        interval_ms: u64,
    },
    MessageQueued {
        queue_id: QueueId,
    },
    MessageSending {
        queue_id: QueueId,
        attempt: u32,
    },
    MessageSent {
        queue_id: QueueId,
        server_message: Option<Value>,
    },
    MessageFailed {
        queue_id: QueueId,
        code: SendErrorCode,
        error: String,
    },
    MessageCancelled {
        queue_id: QueueId,
    },
    MessageSendError {
        queue_id: QueueId,
        code: SendErrorCode,
        user_text: String,
    },
}

impl BusEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::Connecting => "connecting",
            BusEvent::Open => "open",
            BusEvent::Reconnecting { .. } => "reconnecting",
            BusEvent::Failed { .. } => "failed",
            BusEvent::Close => "close",
            BusEvent::StateChanged { .. } => "connectionStateChanged",
            BusEvent::HeartbeatSent { .. } => "heartbeatSent",
            BusEvent::HeartbeatLost => "heartbeatLost",
            BusEvent::AdaptiveHeartbeatChanged { .. } => "adaptiveHeartbeatChanged",
            BusEvent::MessageQueued { .. } => "message:queued",
            BusEvent::MessageSending { .. } => "message:sending",
            BusEvent::MessageSent { .. } => "message:sent",
            BusEvent::MessageFailed { .. } => "message:failed",
            BusEvent::MessageCancelled { .. } => "message:cancelled",
            BusEvent::MessageSendError { .. } => "message:sendError",
        }
    }
}

impl From<ConnectionSignal> for BusEvent {
    fn from(signal: ConnectionSignal) -> Self {
        match signal {
            ConnectionSignal::StateChanged {
                old_state,
                new_state,
                error,
            } => BusEvent::StateChanged {
                old_state,
                new_state,
                error,
            },
            ConnectionSignal::Connecting => BusEvent::Connecting,
            ConnectionSignal::Open => BusEvent::Open,
            ConnectionSignal::Close => BusEvent::Close,
            ConnectionSignal::Reconnecting { attempt, delay_ms } => {
                BusEvent::Reconnecting { attempt, delay_ms }
            }
            ConnectionSignal::Failed { reason } => BusEvent::Failed { reason },
        }
    }
}

// ----------------------------------------------------------------------------
// Bus Seam
// ----------------------------------------------------------------------------

/// Pluggable event sink; implementations fan events out to UI collaborators
pub trait EventBus: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// Bus that drops every event; useful for tests and headless operation
#[derive(Debug, Default, Clone)]
pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _event: BusEvent) {}
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(BusEvent::Connecting.name(), "connecting");
        assert_eq!(
            BusEvent::MessageQueued {
                queue_id: QueueId::generate(crate::types::Timestamp::new(1))
            }
            .name(),
            "message:queued"
        );
        assert_eq!(BusEvent::HeartbeatLost.name(), "heartbeatLost");
        assert_eq!(
            BusEvent::MessageSendError {
                queue_id: QueueId::generate(crate::types::Timestamp::new(1)),
                code: SendErrorCode::Timeout,
                user_text: String::new(),
            }
            .name(),
            "message:sendError"
        );
    }

    #[test]
    fn test_signal_conversion() {
        let event: BusEvent = ConnectionSignal::Reconnecting {
            attempt: 2,
            delay_ms: 2_000,
        }
        .into();
        assert_eq!(event.name(), "reconnecting");
        assert_eq!(
            event,
            BusEvent::Reconnecting {
                attempt: 2,
                delay_ms: 2_000
            }
        );
    }
}
