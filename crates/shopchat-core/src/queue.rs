//! Outbound send queue: drafts, fingerprint dedup, FIFO retry lifecycle
//!
//! Pure queue state. The async shell drives it through `next_ready` /
//! `mark_*` and performs the actual I/O; the queue decides ordering, dedup,
//! retry budgets and terminal failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::SendConfig;
use crate::errors::{classify_send_failure, HttpFailure, SendErrorCode};
use crate::types::{ConversationId, QueueId, Timestamp};

// ----------------------------------------------------------------------------
// Drafts
// ----------------------------------------------------------------------------

/// Body of an outbound draft, one variant per send intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DraftBody {
    Text { content: String },
    File { name: String, size: u64, mime_type: String },
    Voice { duration_ms: u64, size: u64 },
}

impl DraftBody {
    /// Wire name of the draft kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            DraftBody::Text { .. } => "text",
            DraftBody::File { .. } => "file",
            DraftBody::Voice { .. } => "voice",
        }
    }

    /// Leading characters of text content; empty for binary drafts
    fn content_prefix(&self, chars: usize) -> &str {
        match self {
            DraftBody::Text { content } => {
                let end = content
                    .char_indices()
                    .nth(chars)
                    .map(|(i, _)| i)
                    .unwrap_or(content.len());
                &content[..end]
            }
            _ => "",
        }
    }
}

/// Deterministic dedup key for a draft
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `conversation|kind|content-prefix|createdAt`
    pub fn compute(
        conversation: &ConversationId,
        body: &DraftBody,
        created_at: Timestamp,
        content_chars: usize,
    ) -> Self {
        Self(format!(
            "{}|{}|{}|{}",
            conversation.as_str(),
            body.kind_name(),
            body.content_prefix(content_chars),
            created_at.as_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An outbound message draft awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendDraft {
    /// Client-side id echoed back by the server for reconciliation
    pub temp_id: String,
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub body: DraftBody,
    pub created_at: Timestamp,
    pub fingerprint: Fingerprint,
}

impl SendDraft {
    pub fn new(
        conversation_id: ConversationId,
        body: DraftBody,
        created_at: Timestamp,
        config: &SendConfig,
    ) -> Self {
        let fingerprint = Fingerprint::compute(
            &conversation_id,
            &body,
            created_at,
            config.fingerprint_content_chars,
        );
        Self {
            temp_id: format!("tmp_{}", Uuid::new_v4().simple()),
            conversation_id,
            body,
            created_at,
            fingerprint,
        }
    }
}

// ----------------------------------------------------------------------------
// Queue Items
// ----------------------------------------------------------------------------

/// Delivery lifecycle of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl SendStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Sending => "sending",
            SendStatus::Sent => "sent",
            SendStatus::Failed => "failed",
        }
    }
}

/// A draft plus its delivery state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueId,
    pub draft: SendDraft,
    pub status: SendStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_code: Option<SendErrorCode>,
    pub sent_at: Option<Timestamp>,
    /// Retried items wait out their backoff before re-entering the drain
    pub not_before: Option<Timestamp>,
    /// Authoritative server echo, attached after reconciliation
    pub server_message: Option<Value>,
}

impl QueueItem {
    fn new(id: QueueId, draft: SendDraft) -> Self {
        Self {
            id,
            draft,
            status: SendStatus::Pending,
            retry_count: 0,
            error: None,
            error_code: None,
            sent_at: None,
            not_before: None,
            server_message: None,
        }
    }
}

/// Per-item summary exposed to UI observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemSummary {
    pub id: QueueId,
    pub kind: String,
    pub status: SendStatus,
    pub retry_count: u32,
    pub error_code: Option<SendErrorCode>,
}

/// Aggregate queue view for UI observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub items: Vec<QueueItemSummary>,
}

// ----------------------------------------------------------------------------
// Queue Decisions
// ----------------------------------------------------------------------------

/// Result of an enqueue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New item created
    Queued(QueueId),
    /// Fingerprint matched a live item; its id is returned instead
    Duplicate(QueueId),
}

impl EnqueueOutcome {
    pub fn queue_id(&self) -> &QueueId {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }
}

/// What the drain loop should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
    /// Head item is ready to send
    Ready(QueueId),
    /// Head item is backing off; wake up after this many milliseconds
    Wait(u64),
    /// Nothing pending, or a send is already in flight
    Idle,
}

/// Outcome of a failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Item went back to pending; retry fires after `delay_ms`
    Retrying {
        attempt: u32,
        delay_ms: u64,
        code: SendErrorCode,
    },
    /// Retry budget exhausted; item is terminally failed
    Failed { code: SendErrorCode },
}

// ----------------------------------------------------------------------------
// Send Queue
// ----------------------------------------------------------------------------

/// FIFO send queue with fingerprint dedup and bounded retry
#[derive(Debug)]
pub struct SendQueue {
    config: SendConfig,
    items: Vec<QueueItem>,
}

impl SendQueue {
    pub fn new(config: SendConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
        }
    }

    pub fn config(&self) -> &SendConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &QueueId) -> Option<&QueueItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    fn get_mut(&mut self, id: &QueueId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    /// Add a draft, absorbing duplicates.
    ///
    /// A draft whose fingerprint matches any non-`failed` item is not added;
    /// the existing item's id is returned so rapid double-submits resolve to
    /// one outbound message.
    pub fn enqueue(&mut self, draft: SendDraft, now: Timestamp) -> EnqueueOutcome {
        if let Some(existing) = self.items.iter().find(|item| {
            item.status != SendStatus::Failed && item.draft.fingerprint == draft.fingerprint
        }) {
            debug!(id = %existing.id, "duplicate draft absorbed");
            return EnqueueOutcome::Duplicate(existing.id.clone());
        }
        let id = QueueId::generate(now);
        debug!(%id, kind = draft.body.kind_name(), "draft queued");
        self.items.push(QueueItem::new(id.clone(), draft));
        EnqueueOutcome::Queued(id)
    }

    /// Next drain decision, preserving FIFO over pending items.
    ///
    /// At most one item is in flight: while anything is `sending` the drain
    /// idles. The head of the pending set is never skipped; if it is backing
    /// off, the drain waits for it.
    pub fn next_ready(&self, now: Timestamp) -> DrainStep {
        if self.items.iter().any(|i| i.status == SendStatus::Sending) {
            return DrainStep::Idle;
        }
        let Some(head) = self.items.iter().find(|i| i.status == SendStatus::Pending) else {
            return DrainStep::Idle;
        };
        match head.not_before {
            Some(at) if at.as_millis() > now.as_millis() => {
                DrainStep::Wait(at.as_millis() - now.as_millis())
            }
            _ => DrainStep::Ready(head.id.clone()),
        }
    }

    /// Transition an item into `sending`
    pub fn mark_sending(&mut self, id: &QueueId) -> bool {
        match self.get_mut(id) {
            Some(item) if item.status == SendStatus::Pending => {
                item.status = SendStatus::Sending;
                item.not_before = None;
                true
            }
            _ => false,
        }
    }

    /// Delivery succeeded; the item is retained for server reconciliation
    pub fn mark_sent(&mut self, id: &QueueId, now: Timestamp) -> bool {
        match self.get_mut(id) {
            Some(item) if item.status == SendStatus::Sending => {
                item.status = SendStatus::Sent;
                item.sent_at = Some(now);
                item.error = None;
                item.error_code = None;
                true
            }
            _ => false,
        }
    }

    /// Delivery failed; retry within budget or fail terminally
    pub fn mark_failed_attempt(
        &mut self,
        id: &QueueId,
        failure: &HttpFailure,
        now: Timestamp,
    ) -> Option<FailureDisposition> {
        let max_retries = self.config.max_retries;
        let config = self.config.clone();
        let item = self.get_mut(id)?;
        if item.status != SendStatus::Sending {
            return None;
        }
        let code = classify_send_failure(failure);
        item.error = Some(failure.to_string());
        item.error_code = Some(code);

        if item.retry_count < max_retries {
            item.retry_count += 1;
            let delay_ms = config.retry_delay_ms(item.retry_count);
            item.status = SendStatus::Pending;
            item.not_before = Some(now.add_millis(delay_ms));
            debug!(%id, attempt = item.retry_count, delay_ms, code = code.name(), "send retry scheduled");
            Some(FailureDisposition::Retrying {
                attempt: item.retry_count,
                delay_ms,
                code,
            })
        } else {
            item.status = SendStatus::Failed;
            debug!(%id, code = code.name(), "send terminally failed");
            Some(FailureDisposition::Failed { code })
        }
    }

    /// Explicit caller retry of a terminally failed item
    pub fn retry(&mut self, id: &QueueId) -> bool {
        match self.get_mut(id) {
            Some(item) if item.status == SendStatus::Failed => {
                item.status = SendStatus::Pending;
                item.retry_count = 0;
                item.error = None;
                item.error_code = None;
                item.not_before = None;
                true
            }
            _ => false,
        }
    }

    /// Remove a non-`sending` item; in-flight sends cannot be cancelled
    pub fn cancel(&mut self, id: &QueueId) -> Option<QueueItem> {
        let index = self
            .items
            .iter()
            .position(|item| &item.id == id && item.status != SendStatus::Sending)?;
        Some(self.items.remove(index))
    }

    /// Correlate a server-echoed message back onto the `sent` item whose
    /// draft carries the echoed `temp_id`
    pub fn mark_server_message(&mut self, server_message: &Value) -> Option<QueueId> {
        let temp_id = server_message.get("temp_id").and_then(Value::as_str)?;
        let item = self.items.iter_mut().find(|item| {
            item.status == SendStatus::Sent && item.draft.temp_id == temp_id
        })?;
        item.server_message = Some(server_message.clone());
        Some(item.id.clone())
    }

    /// Drop reconciled `sent` items, returning their ids
    pub fn prune_reconciled(&mut self) -> Vec<QueueId> {
        let mut pruned = Vec::new();
        self.items.retain(|item| {
            if item.status == SendStatus::Sent && item.server_message.is_some() {
                pruned.push(item.id.clone());
                false
            } else {
                true
            }
        });
        pruned
    }

    /// Aggregate counts and per-item summaries
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot {
            pending: 0,
            sending: 0,
            sent: 0,
            failed: 0,
            items: Vec::with_capacity(self.items.len()),
        };
        for item in &self.items {
            match item.status {
                SendStatus::Pending => snapshot.pending += 1,
                SendStatus::Sending => snapshot.sending += 1,
                SendStatus::Sent => snapshot.sent += 1,
                SendStatus::Failed => snapshot.failed += 1,
            }
            snapshot.items.push(QueueItemSummary {
                id: item.id.clone(),
                kind: item.draft.body.kind_name().to_string(),
                status: item.status,
                retry_count: item.retry_count,
                error_code: item.error_code,
            });
        }
        snapshot
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
