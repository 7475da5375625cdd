//! Error types for the shopchat delivery subsystem
//!
//! Contains the transport/send error types, the stable send-error taxonomy
//! surfaced to UI collaborators, and the classifier that maps raw failures
//! onto it.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport-level failures surfaced by a `Transport` implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Transport closed: {reason}")]
    Closed { reason: String },
}

/// Raw failure from the HTTP layer
///
/// Carries the structured status when the transport could surface one; the
/// classifier prefers it over message sniffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFailure {
    /// HTTP status code, when the request reached the server
    pub status: Option<u16>,
    /// Raw error text (legacy classification fallback)
    pub message: String,
}

impl HttpFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Failure without a status (network error, transport not connected, ...)
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for HttpFailure {}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for the shopchat delivery subsystem
#[derive(Debug, thiserror::Error)]
pub enum ShopchatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpFailure),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("No active conversation")]
    NoConversation,

    #[error("Empty message content")]
    EmptyContent,

    /// Channel communication error (internal to the actor architecture)
    #[error("Channel error: {message}")]
    Channel { message: String },
}

impl ShopchatError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ShopchatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        ShopchatError::Channel {
            message: message.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, ShopchatError>;

// ----------------------------------------------------------------------------
// Send Error Taxonomy
// ----------------------------------------------------------------------------

/// Stable classification of send failures
///
/// Drives both user-facing text and programmatic retry handling; the order of
/// the fallback rules in [`classify_send_failure`] is part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendErrorCode {
    NotConnected,
    Timeout,
    RateLimit,
    PayloadInvalid,
    ServerError,
    Unknown,
}

impl SendErrorCode {
    /// Wire/event name for the code
    pub fn name(&self) -> &'static str {
        match self {
            SendErrorCode::NotConnected => "NOT_CONNECTED",
            SendErrorCode::Timeout => "TIMEOUT",
            SendErrorCode::RateLimit => "RATE_LIMIT",
            SendErrorCode::PayloadInvalid => "PAYLOAD_INVALID",
            SendErrorCode::ServerError => "SERVER_ERROR",
            SendErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Default user-facing text for the code
    pub fn user_text(&self) -> &'static str {
        match self {
            SendErrorCode::NotConnected => "connection not established",
            SendErrorCode::Timeout => "send timed out",
            SendErrorCode::RateLimit => "sending too fast, try again shortly",
            SendErrorCode::PayloadInvalid => "message content rejected",
            SendErrorCode::ServerError => "server failed to process the message",
            SendErrorCode::Unknown => "message failed to send",
        }
    }
}

impl fmt::Display for SendErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Classify a raw HTTP failure into the send-error taxonomy.
///
/// Structured status wins when present; otherwise the legacy ordered
/// message-sniffing rules apply, first match wins, `Unknown` is the default.
pub fn classify_send_failure(failure: &HttpFailure) -> SendErrorCode {
    if let Some(status) = failure.status {
        match status {
            429 => return SendErrorCode::RateLimit,
            408 => return SendErrorCode::Timeout,
            500..=599 => return SendErrorCode::ServerError,
            _ => {}
        }
    }

    let raw = failure.message.to_lowercase();

    if raw.contains("not connected") || raw.contains("websocket") && raw.contains("closed") {
        return SendErrorCode::NotConnected;
    }
    if raw.contains("timeout") || raw.contains("timed out") {
        return SendErrorCode::Timeout;
    }
    if raw.contains("429") || raw.contains("rate limit") {
        return SendErrorCode::RateLimit;
    }
    if raw.contains("payload") || raw.contains("invalid") || raw.contains("content") {
        return SendErrorCode::PayloadInvalid;
    }
    if raw.contains("server error") || contains_5xx_token(&raw) {
        return SendErrorCode::ServerError;
    }

    SendErrorCode::Unknown
}

/// True if the text carries a standalone 5xx status token (e.g. "http 503")
fn contains_5xx_token(raw: &str) -> bool {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(|code| (500..=599).contains(&code))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
