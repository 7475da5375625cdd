//! Messaging runtime composition root
//!
//! Wires the connection actor, the send channel, and the inbound message
//! processor together: raw frames from the transport flow through the
//! processor, heartbeat acks confirm liveness, and server-echoed messages
//! reconcile the send queue.

use std::sync::Arc;

use serde_json::{json, Value};
use shopchat_core::envelope::KIND_HEARTBEAT;
use shopchat_core::{
    ConnectionConfig, MessageProcessor, ProcessorConfig, SendConfig, SystemTimeSource, TimeSource,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::BroadcastBus;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::http::HttpClient;
use crate::send_channel::{ConversationSource, SendChannel, SendChannelHandle};
use crate::transport::Connector;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Aggregate configuration for the messaging runtime
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub connection: ConnectionConfig,
    pub send: SendConfig,
    pub processor: ProcessorConfig,
}

// ----------------------------------------------------------------------------
// Messaging Runtime
// ----------------------------------------------------------------------------

/// Builder for the full delivery subsystem.
///
/// Configure the processor (handlers, middleware, validators) before calling
/// [`MessagingRuntime::start`]; afterwards the processor runs inside the
/// inbound pump task.
pub struct MessagingRuntime {
    config: RuntimeConfig,
    url: String,
    connector: Arc<dyn Connector>,
    http: Arc<dyn HttpClient>,
    conversations: Arc<dyn ConversationSource>,
    processor: MessageProcessor<SystemTimeSource>,
    bus: BroadcastBus,
}

impl MessagingRuntime {
    pub fn new(
        config: RuntimeConfig,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        http: Arc<dyn HttpClient>,
        conversations: Arc<dyn ConversationSource>,
    ) -> Self {
        let processor = MessageProcessor::with_config(config.processor.clone(), SystemTimeSource);
        Self {
            config,
            url: url.into(),
            connector,
            http,
            conversations,
            processor,
            bus: BroadcastBus::new(),
        }
    }

    /// Processor access for handler/middleware registration before start
    pub fn processor_mut(&mut self) -> &mut MessageProcessor<SystemTimeSource> {
        &mut self.processor
    }

    /// Event bus; subscribe before or after start
    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Spawn all actor tasks and begin connecting
    pub fn start(self) -> RuntimeHandles {
        let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
        let bus = Arc::new(self.bus.clone());

        let (connection, inbound) = ConnectionManager::spawn(
            self.config.connection,
            self.connector,
            self.url,
            bus.clone(),
            time_source.clone(),
        );

        let sends = SendChannel::spawn(
            self.config.send,
            connection.clone(),
            self.http,
            self.conversations,
            bus,
            time_source,
        );

        let pump = spawn_inbound_pump(self.processor, inbound, connection.clone(), sends.clone());
        connection.connect();

        RuntimeHandles {
            connection,
            sends,
            bus: self.bus,
            pump,
        }
    }
}

/// Running subsystem handles
pub struct RuntimeHandles {
    pub connection: ConnectionHandle,
    pub sends: SendChannelHandle,
    pub bus: BroadcastBus,
    pump: JoinHandle<()>,
}

impl RuntimeHandles {
    /// Disconnect and stop the inbound pump
    pub async fn shutdown(self) {
        self.connection.disconnect();
        self.pump.abort();
        let _ = self.pump.await;
    }
}

// ----------------------------------------------------------------------------
// Inbound Pump
// ----------------------------------------------------------------------------

fn spawn_inbound_pump(
    mut processor: MessageProcessor<SystemTimeSource>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    connection: ConnectionHandle,
    sends: SendChannelHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = inbound.recv().await {
            let context = json!({ "source": "transport" });
            let envelope = processor.process(&raw, &context);

            if envelope.kind == KIND_HEARTBEAT {
                connection.confirm_heartbeat(envelope.client_sent_at());
                continue;
            }

            // Server echoes of our own sends carry the draft's temp_id
            if extract_temp_id(&envelope.payload).is_some() {
                let _ = sends.mark_server_message(envelope.payload.clone()).await;
            }
        }
        debug!("inbound pump stopped");
    })
}

fn extract_temp_id(payload: &Value) -> Option<&str> {
    payload.get("temp_id").and_then(Value::as_str)
}
