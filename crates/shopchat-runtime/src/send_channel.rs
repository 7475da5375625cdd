//! Send channel actor
//!
//! Turns user send intents into queued, deduplicated, retryable delivery
//! attempts. The queue logic lives in `shopchat-core`; this actor resolves
//! the active conversation, performs the HTTP delivery (two-phase for
//! binaries), and publishes lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use shopchat_core::{
    BusEvent, ConnectionState, ConversationId, DraftBody, DrainStep, EnqueueOutcome, EventBus,
    FailureDisposition, HttpFailure, QueueId, QueueSnapshot, Result, SendConfig, SendDraft,
    SendQueue, ShopchatError, TimeSource, Timestamp,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::http::{HttpClient, MessagePost, UploadField, UploadRequest};

// ----------------------------------------------------------------------------
// Conversation Seam
// ----------------------------------------------------------------------------

/// Resolves the conversation a send intent targets; provided by the
/// application's coordinator state
pub trait ConversationSource: Send + Sync {
    fn active_conversation(&self) -> Option<ConversationId>;
}

/// Fixed conversation, for tests and single-conversation embeds
pub struct StaticConversation(pub ConversationId);

impl ConversationSource for StaticConversation {
    fn active_conversation(&self) -> Option<ConversationId> {
        Some(self.0.clone())
    }
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum Command {
    SendText {
        content: String,
        reply: oneshot::Sender<Result<QueueId>>,
    },
    SendFile {
        name: String,
        mime_type: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<QueueId>>,
    },
    SendVoice {
        bytes: Vec<u8>,
        duration_ms: u64,
        reply: oneshot::Sender<Result<QueueId>>,
    },
    Retry {
        id: QueueId,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        id: QueueId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    MarkServerMessage {
        message: Value,
        reply: oneshot::Sender<Option<QueueId>>,
    },
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Clonable handle to a running send channel actor
#[derive(Clone)]
pub struct SendChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SendChannelHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ShopchatError::channel_error("send channel stopped"))?;
        rx.await
            .map_err(|_| ShopchatError::channel_error("send channel dropped reply"))
    }

    /// Queue a text message for delivery
    pub async fn send_text(&self, content: impl Into<String>) -> Result<QueueId> {
        let content = content.into();
        self.request(|reply| Command::SendText { content, reply })
            .await?
    }

    /// Queue a file message; the binary is uploaded before the message post
    pub async fn send_file(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<QueueId> {
        let name = name.into();
        let mime_type = mime_type.into();
        self.request(|reply| Command::SendFile {
            name,
            mime_type,
            bytes,
            reply,
        })
        .await?
    }

    /// Queue a voice message; the audio is uploaded before the message post
    pub async fn send_voice(&self, bytes: Vec<u8>, duration_ms: u64) -> Result<QueueId> {
        self.request(|reply| Command::SendVoice {
            bytes,
            duration_ms,
            reply,
        })
        .await?
    }

    /// Reset a terminally failed item to pending with a fresh retry budget
    pub async fn retry(&self, id: QueueId) -> Result<bool> {
        self.request(|reply| Command::Retry { id, reply }).await
    }

    /// Remove an item that has not entered sending
    pub async fn cancel(&self, id: QueueId) -> Result<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Aggregate queue counts and per-item summaries
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Correlate a server-echoed message back onto its sent queue item
    pub async fn mark_server_message(&self, message: Value) -> Result<Option<QueueId>> {
        self.request(|reply| Command::MarkServerMessage { message, reply })
            .await
    }
}

// ----------------------------------------------------------------------------
// Send Channel
// ----------------------------------------------------------------------------

/// Spawns and owns the send channel actor task
pub struct SendChannel;

impl SendChannel {
    pub fn spawn(
        config: SendConfig,
        connection: ConnectionHandle,
        http: Arc<dyn HttpClient>,
        conversations: Arc<dyn ConversationSource>,
        bus: Arc<dyn EventBus>,
        time_source: Arc<dyn TimeSource>,
    ) -> SendChannelHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = SendActor {
            queue: SendQueue::new(config),
            connection,
            http,
            conversations,
            bus,
            time_source,
            commands: command_rx,
            binaries: HashMap::new(),
            origin: tokio::time::Instant::now(),
        };
        tokio::spawn(actor.run());
        SendChannelHandle {
            commands: command_tx,
        }
    }
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

struct SendActor {
    queue: SendQueue,
    connection: ConnectionHandle,
    http: Arc<dyn HttpClient>,
    conversations: Arc<dyn ConversationSource>,
    bus: Arc<dyn EventBus>,
    time_source: Arc<dyn TimeSource>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Binary payloads held outside the queue, keyed by queue item
    binaries: HashMap<QueueId, Vec<u8>>,
    origin: tokio::time::Instant,
}

impl SendActor {
    /// Monotonic clock used for retry backoff gating
    fn mono_now(&self) -> Timestamp {
        Timestamp::new(self.origin.elapsed().as_millis() as u64)
    }

    async fn run(mut self) {
        loop {
            // Drain everything ready before going back to sleep
            let wait_ms = loop {
                match self.queue.next_ready(self.mono_now()) {
                    DrainStep::Ready(id) => self.deliver(id).await,
                    DrainStep::Wait(ms) => break Some(ms),
                    DrainStep::Idle => break None,
                }
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = sleep_opt(wait_ms) => {}
            }
        }
        debug!("send channel actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendText { content, reply } => {
                let result = self.enqueue_intent(None, |_| {
                    if content.trim().is_empty() {
                        Err(ShopchatError::EmptyContent)
                    } else {
                        Ok(DraftBody::Text { content })
                    }
                });
                let _ = reply.send(result);
            }
            Command::SendFile {
                name,
                mime_type,
                bytes,
                reply,
            } => {
                let size = bytes.len() as u64;
                let result = self.enqueue_intent(Some(bytes), |_| {
                    Ok(DraftBody::File {
                        name,
                        size,
                        mime_type,
                    })
                });
                let _ = reply.send(result);
            }
            Command::SendVoice {
                bytes,
                duration_ms,
                reply,
            } => {
                let size = bytes.len() as u64;
                let result = self.enqueue_intent(Some(bytes), |_| {
                    Ok(DraftBody::Voice { duration_ms, size })
                });
                let _ = reply.send(result);
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.queue.retry(&id));
            }
            Command::Cancel { id, reply } => {
                let cancelled = self.queue.cancel(&id).is_some();
                if cancelled {
                    self.binaries.remove(&id);
                    self.bus
                        .publish(BusEvent::MessageCancelled { queue_id: id });
                }
                let _ = reply.send(cancelled);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::MarkServerMessage { message, reply } => {
                let matched = self.queue.mark_server_message(&message);
                for pruned in self.queue.prune_reconciled() {
                    self.binaries.remove(&pruned);
                }
                let _ = reply.send(matched);
            }
        }
    }

    fn enqueue_intent(
        &mut self,
        binary: Option<Vec<u8>>,
        build: impl FnOnce(&ConversationId) -> Result<DraftBody>,
    ) -> Result<QueueId> {
        let conversation = self
            .conversations
            .active_conversation()
            .ok_or(ShopchatError::NoConversation)?;
        let body = build(&conversation)?;
        let now = self.time_source.now();
        let draft = SendDraft::new(conversation, body, now, self.queue.config());

        match self.queue.enqueue(draft, now) {
            EnqueueOutcome::Queued(id) => {
                if let Some(bytes) = binary {
                    self.binaries.insert(id.clone(), bytes);
                }
                self.bus.publish(BusEvent::MessageQueued {
                    queue_id: id.clone(),
                });
                Ok(id)
            }
            EnqueueOutcome::Duplicate(id) => {
                debug!(%id, "double submit absorbed");
                Ok(id)
            }
        }
    }

    /// Deliver one queue item end to end. Exactly one delivery runs at a
    /// time; commands queue up behind it.
    async fn deliver(&mut self, id: QueueId) {
        if !self.queue.mark_sending(&id) {
            return;
        }
        let item = match self.queue.get(&id) {
            Some(item) => item.clone(),
            None => return,
        };
        self.bus.publish(BusEvent::MessageSending {
            queue_id: id.clone(),
            attempt: item.retry_count,
        });

        let outcome = self.attempt_delivery(&item.draft, &id).await;
        let now = self.mono_now();
        match outcome {
            Ok(server_message) => {
                self.queue.mark_sent(&id, self.time_source.now());
                self.binaries.remove(&id);
                let reconciled = self.queue.mark_server_message(&server_message);
                if reconciled.is_some() {
                    self.queue.prune_reconciled();
                }
                self.bus.publish(BusEvent::MessageSent {
                    queue_id: id,
                    server_message: Some(server_message),
                });
            }
            Err(failure) => {
                match self.queue.mark_failed_attempt(&id, &failure, now) {
                    Some(FailureDisposition::Retrying {
                        attempt,
                        delay_ms,
                        code,
                    }) => {
                        debug!(%id, attempt, delay_ms, code = code.name(), "delivery retry scheduled");
                    }
                    Some(FailureDisposition::Failed { code }) => {
                        warn!(%id, code = code.name(), %failure, "delivery terminally failed");
                        self.binaries.remove(&id);
                        self.bus.publish(BusEvent::MessageFailed {
                            queue_id: id.clone(),
                            code,
                            error: failure.to_string(),
                        });
                        self.bus.publish(BusEvent::MessageSendError {
                            queue_id: id,
                            code,
                            user_text: code.user_text().to_string(),
                        });
                    }
                    None => {}
                }
            }
        }
    }

    /// Phase one (binary upload) then phase two (message post); an upload
    /// failure never reaches phase two
    async fn attempt_delivery(
        &self,
        draft: &SendDraft,
        id: &QueueId,
    ) -> std::result::Result<Value, HttpFailure> {
        if self.connection.info().state != ConnectionState::Connected {
            return Err(HttpFailure::unreachable("transport not connected"));
        }

        let content = match &draft.body {
            DraftBody::Text { content } => json!({ "text": content }),
            DraftBody::File {
                name,
                size,
                mime_type,
            } => {
                let bytes = self.binary_for(id)?;
                let uploaded = self
                    .http
                    .upload(&UploadRequest {
                        field: UploadField::File,
                        name: name.clone(),
                        mime_type: mime_type.clone(),
                        bytes,
                    })
                    .await?;
                json!({ "name": name, "size": size, "url": uploaded.url })
            }
            DraftBody::Voice { duration_ms, size } => {
                let bytes = self.binary_for(id)?;
                let uploaded = self
                    .http
                    .upload(&UploadRequest {
                        field: UploadField::Audio,
                        name: "voice-message".to_string(),
                        mime_type: "audio/webm".to_string(),
                        bytes,
                    })
                    .await?;
                json!({ "duration_ms": duration_ms, "size": size, "url": uploaded.url })
            }
        };

        self.http
            .post_message(&MessagePost {
                conversation_id: draft.conversation_id.clone(),
                temp_id: draft.temp_id.clone(),
                kind: draft.body.kind_name().to_string(),
                content,
            })
            .await
    }

    fn binary_for(&self, id: &QueueId) -> std::result::Result<Vec<u8>, HttpFailure> {
        self.binaries
            .get(id)
            .cloned()
            .ok_or_else(|| HttpFailure::unreachable("binary payload missing"))
    }
}

async fn sleep_opt(ms: Option<u64>) {
    match ms {
        Some(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms)).await,
        None => std::future::pending().await,
    }
}
