//! Inbound message processing and dispatch
//!
//! Converts raw transport payloads into validated canonical envelopes and
//! routes them through an ordered middleware chain to registered type
//! handlers and generic listeners. The processor never fails across its
//! public boundary: every failure becomes a `type:"error"` envelope
//! dispatched to the error listeners.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ProcessorConfig;
use crate::envelope::{self, MessageEnvelope, ParseOptions, SerializeOptions, KIND_UNKNOWN};
use crate::types::{TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Handler and Middleware Types
// ----------------------------------------------------------------------------

/// Identifier of a registered handler, middleware, or listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Type handler callback
pub type HandlerFn = Box<dyn FnMut(&MessageEnvelope, &Value) -> Result<(), String> + Send>;
/// Per-handler gate predicate
pub type ValidateFn = Box<dyn Fn(&MessageEnvelope) -> bool + Send>;
/// Middleware transform; errors are logged and skipped
pub type MiddlewareFn = Box<dyn FnMut(MessageEnvelope, &Value) -> Result<MessageEnvelope, String> + Send>;
/// Generic listener callback
pub type ListenerFn = Box<dyn FnMut(&MessageEnvelope, &Value) + Send>;
/// Per-type validator; returns a reason on rejection
pub type ValidatorFn = Box<dyn Fn(&MessageEnvelope) -> Result<(), String> + Send>;

/// Options for handler registration
#[derive(Default)]
pub struct HandlerOptions {
    /// Handlers run in descending priority order
    pub priority: i32,
    /// Remove the handler after its first successful run
    pub once: bool,
    /// Skip the handler when the predicate rejects the envelope
    pub validate: Option<ValidateFn>,
}

struct HandlerEntry {
    id: RegistrationId,
    priority: i32,
    once: bool,
    validate: Option<ValidateFn>,
    callback: HandlerFn,
}

struct MiddlewareEntry {
    id: RegistrationId,
    priority: i32,
    name: String,
    callback: MiddlewareFn,
}

struct ListenerEntry {
    id: RegistrationId,
    callback: ListenerFn,
}

/// Generic listener channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Fires for every processed envelope regardless of type
    Message,
    /// Fires for error envelopes and dispatch failures
    Error,
}

// ----------------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------------

/// Counters for processor observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorMetrics {
    /// Envelopes run through `process`
    pub processed: u64,
    /// Raw strings parsed as JSON
    pub parsed: u64,
    /// Envelopes that passed validation
    pub validated: u64,
    /// Parse/validate/dispatch failures
    pub errors: u64,
}

// ----------------------------------------------------------------------------
// Message Processor
// ----------------------------------------------------------------------------

/// Parses, validates, and dispatches inbound messages
pub struct MessageProcessor<T: TimeSource> {
    config: ProcessorConfig,
    time_source: T,
    handlers: HashMap<String, Vec<HandlerEntry>>,
    middlewares: Vec<MiddlewareEntry>,
    validators: HashMap<String, ValidatorFn>,
    listeners: HashMap<ListenerKind, Vec<ListenerEntry>>,
    history: VecDeque<MessageEnvelope>,
    metrics: ProcessorMetrics,
    next_id: u64,
}

impl<T: TimeSource> MessageProcessor<T> {
    /// Create a processor with default configuration
    pub fn new(time_source: T) -> Self {
        Self::with_config(ProcessorConfig::default(), time_source)
    }

    /// Create a processor with custom configuration
    pub fn with_config(config: ProcessorConfig, time_source: T) -> Self {
        Self {
            config,
            time_source,
            handlers: HashMap::new(),
            middlewares: Vec::new(),
            validators: HashMap::new(),
            listeners: HashMap::new(),
            history: VecDeque::new(),
            metrics: ProcessorMetrics::default(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> RegistrationId {
        self.next_id += 1;
        RegistrationId(self.next_id)
    }

    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a handler for a message type.
    ///
    /// Multiple handlers per type run in descending priority order; `once`
    /// handlers are removed after their first successful run.
    pub fn register_handler(
        &mut self,
        kind: impl Into<String>,
        callback: HandlerFn,
        options: HandlerOptions,
    ) -> RegistrationId {
        let kind = kind.into();
        let id = self.allocate_id();
        let entries = self.handlers.entry(kind.clone()).or_default();
        entries.push(HandlerEntry {
            id,
            priority: options.priority,
            once: options.once,
            validate: options.validate,
            callback,
        });
        // Stable sort keeps registration order among equal priorities
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!(kind = %kind, priority = options.priority, "registered message handler");
        id
    }

    /// Remove a handler; returns whether it existed
    pub fn unregister_handler(&mut self, kind: &str, id: RegistrationId) -> bool {
        if let Some(entries) = self.handlers.get_mut(kind) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            return entries.len() != before;
        }
        false
    }

    /// Register a middleware transform applied to every envelope before
    /// dispatch, in descending priority order.
    pub fn use_middleware(
        &mut self,
        name: impl Into<String>,
        callback: MiddlewareFn,
        priority: i32,
    ) -> RegistrationId {
        let id = self.allocate_id();
        self.middlewares.push(MiddlewareEntry {
            id,
            priority,
            name: name.into(),
            callback,
        });
        self.middlewares.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    /// Remove a middleware; returns whether it existed
    pub fn remove_middleware(&mut self, id: RegistrationId) -> bool {
        let before = self.middlewares.len();
        self.middlewares.retain(|entry| entry.id != id);
        self.middlewares.len() != before
    }

    /// Register a validator for a message type, run during `process` when
    /// validation is enabled.
    pub fn register_validator(&mut self, kind: impl Into<String>, validator: ValidatorFn) {
        self.validators.insert(kind.into(), validator);
    }

    /// Register a cross-cutting listener (`Message` fires for every envelope,
    /// `Error` for failures).
    pub fn on(&mut self, kind: ListenerKind, callback: ListenerFn) -> RegistrationId {
        let id = self.allocate_id();
        self.listeners
            .entry(kind)
            .or_default()
            .push(ListenerEntry { id, callback });
        id
    }

    /// Remove a listener; returns whether it existed
    pub fn off(&mut self, kind: ListenerKind, id: RegistrationId) -> bool {
        if let Some(entries) = self.listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            return entries.len() != before;
        }
        false
    }

    // ------------------------------------------------------------------
    // Parsing and Serialization
    // ------------------------------------------------------------------

    /// Parse a raw string into a canonical envelope (never fails)
    pub fn parse(&mut self, raw: &str) -> MessageEnvelope {
        self.metrics.parsed += 1;
        let options = ParseOptions {
            allow_plain_text: self.config.allow_plain_text,
        };
        envelope::parse_str(raw, &options, self.now())
    }

    /// Standardize an already-structured value (never fails)
    pub fn parse_value(&mut self, value: Value) -> MessageEnvelope {
        self.metrics.parsed += 1;
        envelope::parse_value(value, self.now())
    }

    /// Serialize an envelope for the wire
    pub fn serialize(&self, message: &MessageEnvelope, options: &SerializeOptions) -> String {
        envelope::serialize_with(message, options, self.now())
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Parse, validate, record, and dispatch a raw payload.
    ///
    /// Returns the envelope that was dispatched; failures come back as
    /// `type:"error"` envelopes after the error listeners have fired.
    pub fn process(&mut self, raw: &str, context: &Value) -> MessageEnvelope {
        let parsed = self.parse(raw);
        self.process_envelope(parsed, context)
    }

    /// Validate, record, and dispatch an already-parsed envelope.
    pub fn process_envelope(&mut self, parsed: MessageEnvelope, context: &Value) -> MessageEnvelope {
        self.metrics.processed += 1;

        let parsed = match self.validate(parsed) {
            Ok(envelope) => envelope,
            Err(failed) => {
                self.metrics.errors += 1;
                self.dispatch_listeners(ListenerKind::Error, &failed, context);
                return failed;
            }
        };

        if self.config.enable_history {
            self.record_history(parsed.clone());
        }

        let transformed = self.run_middlewares(parsed, context);

        self.dispatch_by_type(&transformed, context);
        self.dispatch_listeners(ListenerKind::Message, &transformed, context);
        if transformed.is_error() {
            self.metrics.errors += 1;
            self.dispatch_listeners(ListenerKind::Error, &transformed, context);
        }

        transformed
    }

    fn validate(&mut self, parsed: MessageEnvelope) -> Result<MessageEnvelope, MessageEnvelope> {
        if !self.config.enable_validation {
            return Ok(parsed);
        }
        if parsed.kind == KIND_UNKNOWN {
            let now = self.now();
            return Err(MessageEnvelope::error(
                "message is missing a type",
                parsed.payload,
                now,
            ));
        }
        if let Some(validator) = self.validators.get(&parsed.kind) {
            if let Err(reason) = validator(&parsed) {
                warn!(kind = %parsed.kind, %reason, "message failed validation");
                let now = self.now();
                return Err(MessageEnvelope::error(
                    format!("validation failed: {reason}"),
                    parsed.payload,
                    now,
                ));
            }
        }
        self.metrics.validated += 1;
        Ok(parsed)
    }

    fn run_middlewares(&mut self, message: MessageEnvelope, context: &Value) -> MessageEnvelope {
        let mut current = message;
        for middleware in &mut self.middlewares {
            match (middleware.callback)(current.clone(), context) {
                Ok(next) => current = next,
                Err(reason) => {
                    // A failing middleware is skipped, never aborts the chain
                    warn!(name = %middleware.name, %reason, "middleware failed, skipping");
                }
            }
        }
        current
    }

    fn dispatch_by_type(&mut self, message: &MessageEnvelope, context: &Value) {
        let Some(entries) = self.handlers.get_mut(&message.kind) else {
            debug!(kind = %message.kind, "no handler registered");
            return;
        };

        let mut spent = Vec::new();
        let mut had_error = false;
        for entry in entries.iter_mut() {
            if let Some(validate) = &entry.validate {
                if !validate(message) {
                    continue;
                }
            }
            match (entry.callback)(message, context) {
                Ok(()) => {
                    if entry.once {
                        spent.push(entry.id);
                    }
                }
                Err(reason) => {
                    had_error = true;
                    warn!(kind = %message.kind, %reason, "handler failed");
                }
            }
        }
        entries.retain(|entry| !spent.contains(&entry.id));

        if had_error {
            self.metrics.errors += 1;
        }
    }

    fn dispatch_listeners(&mut self, kind: ListenerKind, message: &MessageEnvelope, context: &Value) {
        if let Some(entries) = self.listeners.get_mut(&kind) {
            for entry in entries.iter_mut() {
                (entry.callback)(message, context);
            }
        }
    }

    fn record_history(&mut self, message: MessageEnvelope) {
        self.history.push_back(message);
        while self.history.len() > self.config.max_history_size {
            self.history.pop_front();
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Processed-envelope history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &MessageEnvelope> {
        self.history.iter()
    }

    /// Processing counters
    pub fn metrics(&self) -> ProcessorMetrics {
        self.metrics
    }

    /// Number of handlers registered across all types
    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemTimeSource;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn processor() -> MessageProcessor<SystemTimeSource> {
        MessageProcessor::new(SystemTimeSource)
    }

    fn counter_handler(counter: Arc<AtomicU32>) -> HandlerFn {
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_typed_dispatch() {
        let mut p = processor();
        let hits = Arc::new(AtomicU32::new(0));
        p.register_handler("ping", counter_handler(hits.clone()), HandlerOptions::default());

        let env = p.process(r#"{"type":"ping"}"#, &Value::Null);
        assert_eq!(env.kind, "ping");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.process(r#"{"type":"pong"}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_order() {
        let mut p = processor();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (name, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            p.register_handler(
                "evt",
                Box::new(move |_, _| {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
                HandlerOptions {
                    priority,
                    ..HandlerOptions::default()
                },
            );
        }

        p.process(r#"{"type":"evt"}"#, &Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_once_handler_fires_once() {
        let mut p = processor();
        let hits = Arc::new(AtomicU32::new(0));
        p.register_handler(
            "evt",
            counter_handler(hits.clone()),
            HandlerOptions {
                once: true,
                ..HandlerOptions::default()
            },
        );

        p.process(r#"{"type":"evt"}"#, &Value::Null);
        p.process(r#"{"type":"evt"}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(p.handler_count(), 0);
    }

    #[test]
    fn test_handler_validate_gate() {
        let mut p = processor();
        let hits = Arc::new(AtomicU32::new(0));
        p.register_handler(
            "evt",
            counter_handler(hits.clone()),
            HandlerOptions {
                validate: Some(Box::new(|env| env.payload["accept"] == true)),
                ..HandlerOptions::default()
            },
        );

        p.process(r#"{"type":"evt","accept":false}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        p.process(r#"{"type":"evt","accept":true}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_middleware_transforms_and_failures_skip() {
        let mut p = processor();
        p.use_middleware(
            "tag",
            Box::new(|mut env, _| {
                env.payload["tagged"] = json!(true);
                Ok(env)
            }),
            10,
        );
        p.use_middleware("broken", Box::new(|_, _| Err("boom".to_string())), 5);

        let env = p.process(r#"{"type":"evt"}"#, &Value::Null);
        // The failing middleware must not undo the earlier transform
        assert_eq!(env.payload["tagged"], true);
    }

    #[test]
    fn test_validator_rejection_reaches_error_listeners() {
        let mut p = processor();
        let errors = Arc::new(AtomicU32::new(0));
        {
            let errors = errors.clone();
            p.on(
                ListenerKind::Error,
                Box::new(move |env, _| {
                    assert!(env.is_error());
                    errors.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        p.register_validator(
            "order",
            Box::new(|env| {
                if env.payload.get("amount").is_some() {
                    Ok(())
                } else {
                    Err("missing amount".to_string())
                }
            }),
        );

        let env = p.process(r#"{"type":"order"}"#, &Value::Null);
        assert!(env.is_error());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(p.metrics().errors, 1);
    }

    #[test]
    fn test_generic_message_listener_sees_everything() {
        let mut p = processor();
        let hits = Arc::new(AtomicU32::new(0));
        {
            let hits = hits.clone();
            p.on(
                ListenerKind::Message,
                Box::new(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        p.process(r#"{"type":"a"}"#, &Value::Null);
        p.process(r#"{"type":"b"}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_ring_bounded() {
        let config = ProcessorConfig {
            max_history_size: 3,
            ..ProcessorConfig::default()
        };
        let mut p = MessageProcessor::with_config(config, SystemTimeSource);
        for i in 0..5 {
            p.process(&format!(r#"{{"type":"evt","seq":{i}}}"#), &Value::Null);
        }
        let seqs: Vec<u64> = p
            .history()
            .map(|env| env.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_unknown_type_fails_validation() {
        let mut p = processor();
        let env = p.process(r#"{"content":"hi"}"#, &Value::Null);
        assert!(env.is_error());
    }

    #[test]
    fn test_unregister_handler() {
        let mut p = processor();
        let hits = Arc::new(AtomicU32::new(0));
        let id = p.register_handler("evt", counter_handler(hits.clone()), HandlerOptions::default());
        assert!(p.unregister_handler("evt", id));
        assert!(!p.unregister_handler("evt", id));
        p.process(r#"{"type":"evt"}"#, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
