//! Canonical message envelope and wire parsing
//!
//! Converts arbitrary transport payloads into the canonical
//! `{id, type, timestamp, payload}` unit. Parsing never fails across the
//! public boundary: malformed input becomes a `type:"error"` envelope so
//! callers always receive something dispatchable.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::types::Timestamp;

/// Envelope type assigned to wrapped plain-text payloads
pub const KIND_TEXT: &str = "text";
/// Envelope type assigned when the wire payload carried no type at all
pub const KIND_UNKNOWN: &str = "unknown";
/// Envelope type assigned to parse/validation failures
pub const KIND_ERROR: &str = "error";
/// Envelope type of heartbeat probes and their acknowledgments
pub const KIND_HEARTBEAT: &str = "heartbeat";

/// Wire field carrying the probe send time on heartbeat payloads
pub const FIELD_CLIENT_SENT_AT: &str = "clientSentAt";

/// Marker substituted for JSON nested beyond the safe-serialization depth
pub const CIRCULAR_MARKER: &str = "[Circular]";

const SAFE_STRINGIFY_MAX_DEPTH: usize = 64;

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Canonical inbound/outbound message unit
///
/// Invariants: `kind` is non-empty after standardization; `id` is unique per
/// process.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope {
    /// Process-unique message id
    pub id: String,
    /// Message type (`type` on the wire)
    #[serde(rename = "type")]
    pub kind: String,
    /// Millisecond timestamp
    pub timestamp: u64,
    /// Type-specific payload
    #[serde(default)]
    pub payload: Value,
}

impl MessageEnvelope {
    /// Build an envelope with a fresh id and the given clock reading
    pub fn new(kind: impl Into<String>, payload: Value, now: Timestamp) -> Self {
        Self {
            id: generate_envelope_id(),
            kind: kind.into(),
            timestamp: now.as_millis(),
            payload,
        }
    }

    /// Build the outbound heartbeat probe payload
    pub fn heartbeat(now: Timestamp) -> Self {
        Self::new(
            KIND_HEARTBEAT,
            json!({ FIELD_CLIENT_SENT_AT: now.as_millis() }),
            now,
        )
    }

    /// Build an error envelope describing a parse or validation failure
    pub fn error(reason: impl Into<String>, original: Value, now: Timestamp) -> Self {
        Self::new(
            KIND_ERROR,
            json!({ "error": reason.into(), "original": original }),
            now,
        )
    }

    /// `clientSentAt` of a heartbeat envelope, if present
    pub fn client_sent_at(&self) -> Option<u64> {
        self.payload.get(FIELD_CLIENT_SENT_AT).and_then(Value::as_u64)
    }

    /// Whether this envelope represents a failure
    pub fn is_error(&self) -> bool {
        self.kind == KIND_ERROR
    }
}

fn generate_envelope_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

// ----------------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------------

/// Options controlling raw payload parsing
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Wrap non-JSON strings as `text` envelopes instead of erroring
    pub allow_plain_text: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            allow_plain_text: true,
        }
    }
}

/// Parse a raw transport string into a canonical envelope.
///
/// Never fails: structured input is standardized, plain text is wrapped when
/// allowed, and anything else becomes an error envelope.
pub fn parse_str(raw: &str, options: &ParseOptions, now: Timestamp) -> MessageEnvelope {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => parse_value(value, now),
        Err(err) => {
            if options.allow_plain_text {
                MessageEnvelope::new(KIND_TEXT, json!({ "content": raw }), now)
            } else {
                MessageEnvelope::error(
                    format!("JSON parse failed: {err}"),
                    Value::String(raw.to_string()),
                    now,
                )
            }
        }
    }
}

/// Standardize an already-structured value into a canonical envelope.
///
/// Takes ownership, so the caller's value can never alias the envelope.
/// Missing `type` is promoted from `action`; missing `id`/`timestamp` are
/// generated; top-level fields other than the canonical ones fold into the
/// payload unless an explicit `payload` object is present.
pub fn parse_value(value: Value, now: Timestamp) -> MessageEnvelope {
    let mut object = match value {
        Value::Object(map) => map,
        other => {
            return MessageEnvelope::error("payload is not an object", other, now);
        }
    };

    let kind = take_string(&mut object, "type")
        .or_else(|| take_string(&mut object, "action"))
        .unwrap_or_else(|| KIND_UNKNOWN.to_string());

    let id = take_string(&mut object, "id").unwrap_or_else(generate_envelope_id);
    let timestamp = object
        .remove("timestamp")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| now.as_millis());

    let payload = match object.remove("payload") {
        Some(explicit @ Value::Object(_)) => explicit,
        Some(other) => json!({ "value": other }),
        None => Value::Object(object),
    };

    MessageEnvelope {
        id,
        kind,
        timestamp,
        payload,
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(_) | None => None,
    }
}

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------

/// Options controlling envelope serialization
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// Replace over-deep JSON with [`CIRCULAR_MARKER`] instead of failing
    pub safe_stringify: bool,
}

/// Serialize an envelope for the wire, enriching a missing timestamp.
pub fn serialize(envelope: &MessageEnvelope, now: Timestamp) -> String {
    serialize_with(envelope, &SerializeOptions::default(), now)
}

/// Serialize with explicit options.
///
/// With `safe_stringify`, payload nodes nested beyond a depth bound are
/// replaced by the `"[Circular]"` marker rather than producing an error.
pub fn serialize_with(
    envelope: &MessageEnvelope,
    options: &SerializeOptions,
    now: Timestamp,
) -> String {
    let mut enriched = envelope.clone();
    if enriched.timestamp == 0 {
        enriched.timestamp = now.as_millis();
    }
    if options.safe_stringify {
        enriched.payload = clamp_depth(enriched.payload, SAFE_STRINGIFY_MAX_DEPTH);
    }

    // An envelope of plain JSON values cannot fail to serialize; keep the
    // error path anyway so the boundary never panics.
    serde_json::to_string(&enriched).unwrap_or_else(|err| {
        json!({
            "type": KIND_ERROR,
            "error": format!("serialization failed: {err}"),
            "timestamp": now.as_millis(),
        })
        .to_string()
    })
}

fn clamp_depth(value: Value, budget: usize) -> Value {
    if budget == 0 {
        return Value::String(CIRCULAR_MARKER.to_string());
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, clamp_depth(v, budget - 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| clamp_depth(v, budget - 1))
                .collect(),
        ),
        leaf => leaf,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
