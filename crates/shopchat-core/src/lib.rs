//! Shopchat Delivery Core
//!
//! Runtime-independent logic for the shopchat real-time delivery subsystem:
//! the connection lifecycle state machine, heartbeat scheduling, the canonical
//! message envelope with its processor, and the outbound send queue. All I/O
//! and timing live in the runtime crate; everything here is pure state driven
//! by explicit clock readings.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod heartbeat;
pub mod processor;
pub mod queue;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{AdaptiveConfig, ConnectionConfig, ProcessorConfig, SendConfig};
pub use connection::{ConnectionEffect, ConnectionInfo, ConnectionMachine, ConnectionState};
pub use envelope::{MessageEnvelope, ParseOptions, SerializeOptions};
pub use errors::{
    classify_send_failure, HttpFailure, Result, SendErrorCode, ShopchatError, TransportError,
};
pub use events::{BusEvent, ConnectionSignal, EventBus, NullBus};
pub use heartbeat::{AdaptiveHeartbeat, HeartbeatAction, HeartbeatState};
pub use processor::{HandlerOptions, ListenerKind, MessageProcessor, RegistrationId};
pub use queue::{
    DraftBody, DrainStep, EnqueueOutcome, FailureDisposition, Fingerprint, QueueItem,
    QueueSnapshot, SendDraft, SendQueue, SendStatus,
};
pub use types::{
    ConversationId, QualityLevel, QueueId, SystemTimeSource, TimeSource, Timestamp,
};
