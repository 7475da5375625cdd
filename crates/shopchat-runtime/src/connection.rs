//! Connection manager actor
//!
//! Owns the transport, the lifecycle state machine, and all connection
//! timers. Runs as a single spawned task driven by commands, transport
//! events, and timer deadlines; every transition flows through the pure
//! [`ConnectionMachine`] and its effects are executed here.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use shopchat_core::envelope::{self, KIND_HEARTBEAT};
use shopchat_core::{
    AdaptiveHeartbeat, BusEvent, ConnectionConfig, ConnectionEffect, ConnectionInfo,
    ConnectionMachine, ConnectionState, EventBus, HeartbeatAction, HeartbeatState, MessageEnvelope,
    QualityLevel, TimeSource, Timestamp, TransportError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::{BoxedTransport, Connector, TransportEvent};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum Command {
    Connect,
    Disconnect,
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    ConfirmHeartbeat { client_sent_at: Option<u64> },
    QualityChanged(QualityLevel),
    ResetFailure,
}

/// Which pending deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeKind {
    Reconnect,
    Heartbeat,
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Clonable handle to a running connection actor
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    info: Arc<RwLock<ConnectionInfo>>,
}

impl ConnectionHandle {
    /// Begin connecting; no-op while already connecting or connected
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the connection and cancel all pending timers
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Send a raw text frame over the live transport
    pub async fn send_raw(&self, text: String) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { text, reply })
            .map_err(|_| TransportError::NotConnected)?;
        rx.await.map_err(|_| TransportError::NotConnected)?
    }

    /// Feed an inbound heartbeat's `clientSentAt` to the probe cycle; only a
    /// value echoing the outstanding probe confirms it
    pub fn confirm_heartbeat(&self, client_sent_at: Option<u64>) {
        let _ = self.commands.send(Command::ConfirmHeartbeat { client_sent_at });
    }

    /// Feed an external link-quality reading into adaptive heartbeat tuning
    pub fn quality_changed(&self, level: QualityLevel) {
        let _ = self.commands.send(Command::QualityChanged(level));
    }

    /// Clear the terminal failed state so `connect` works again
    pub fn reset_failure(&self) {
        let _ = self.commands.send(Command::ResetFailure);
    }

    /// Snapshot of the current lifecycle state
    pub fn info(&self) -> ConnectionInfo {
        match self.info.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the transport is currently usable
    pub fn is_connected(&self) -> bool {
        self.info().state == ConnectionState::Connected
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Spawns and owns the connection actor task
pub struct ConnectionManager;

impl ConnectionManager {
    /// Spawn the actor. Returns the command handle and the stream of raw
    /// inbound frames for the composition root to process.
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        bus: Arc<dyn EventBus>,
        time_source: Arc<dyn TimeSource>,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let info = Arc::new(RwLock::new(ConnectionInfo::default()));

        let adaptive = config
            .adaptive
            .clone()
            .map(|cfg| AdaptiveHeartbeat::new(cfg, config.heartbeat_interval_ms));

        let actor = ConnectionActor {
            machine: ConnectionMachine::new(config),
            connector,
            url: url.into(),
            bus,
            time_source,
            commands: command_rx,
            conn_results: conn_rx,
            conn_results_tx: conn_tx,
            connect_epoch: 0,
            transport: None,
            heartbeat: None,
            adaptive,
            reconnect_at: None,
            inbound: inbound_tx,
            info: info.clone(),
            origin: Instant::now(),
        };
        tokio::spawn(actor.run());

        (
            ConnectionHandle {
                commands: command_tx,
                info,
            },
            inbound_rx,
        )
    }
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

type ConnectResult = (u64, Result<BoxedTransport, TransportError>);

struct ConnectionActor {
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    url: String,
    bus: Arc<dyn EventBus>,
    time_source: Arc<dyn TimeSource>,
    commands: mpsc::UnboundedReceiver<Command>,
    conn_results: mpsc::UnboundedReceiver<ConnectResult>,
    conn_results_tx: mpsc::UnboundedSender<ConnectResult>,
    /// Invalidates connect attempts that resolve after a disconnect
    connect_epoch: u64,
    transport: Option<BoxedTransport>,
    heartbeat: Option<HeartbeatState>,
    adaptive: Option<AdaptiveHeartbeat>,
    reconnect_at: Option<Instant>,
    inbound: mpsc::UnboundedSender<String>,
    info: Arc<RwLock<ConnectionInfo>>,
    origin: Instant,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            let wake = self.next_wake();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                result = self.conn_results.recv() => {
                    if let Some((epoch, result)) = result {
                        self.handle_connect_result(epoch, result).await;
                    }
                }
                event = next_transport_event(&mut self.transport) => {
                    self.handle_transport_event(event).await;
                }
                _ = sleep_until_opt(wake.map(|(_, at)| at)) => {
                    if let Some((kind, _)) = wake {
                        self.handle_wake(kind).await;
                    }
                }
            }
        }

        // All handles dropped: tear the connection down
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        debug!("connection actor stopped");
    }

    /// Monotonic clock used for all deadline math
    fn mono_now(&self) -> Timestamp {
        Timestamp::new(self.origin.elapsed().as_millis() as u64)
    }

    fn next_wake(&self) -> Option<(WakeKind, Instant)> {
        let reconnect = self.reconnect_at.map(|at| (WakeKind::Reconnect, at));
        let heartbeat = self.heartbeat.as_ref().map(|hb| {
            let at = self.origin + Duration::from_millis(hb.deadline().as_millis());
            (WakeKind::Heartbeat, at)
        });
        match (reconnect, heartbeat) {
            (Some(r), Some(h)) => Some(if r.1 <= h.1 { r } else { h }),
            (r, h) => r.or(h),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let effects = self.machine.connect();
                self.apply_effects(effects).await;
            }
            Command::Disconnect => {
                // Invalidate any connect attempt still in flight
                self.connect_epoch += 1;
                let effects = self.machine.disconnect();
                self.apply_effects(effects).await;
            }
            Command::Send { text, reply } => {
                let result = self.send_frame(text).await;
                let _ = reply.send(result);
            }
            Command::ConfirmHeartbeat { client_sent_at } => {
                let now = self.mono_now();
                if let Some(hb) = self.heartbeat.as_mut() {
                    hb.confirm(client_sent_at, now);
                }
            }
            Command::QualityChanged(level) => self.handle_quality_change(level),
            Command::ResetFailure => {
                let effects = self.machine.reset_failure();
                self.apply_effects(effects).await;
            }
        }
    }

    async fn send_frame(&mut self, text: String) -> Result<(), TransportError> {
        if self.machine.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        match self.transport.as_mut() {
            Some(transport) => transport.send(text).await,
            None => Err(TransportError::NotConnected),
        }
    }

    async fn handle_connect_result(
        &mut self,
        epoch: u64,
        result: Result<BoxedTransport, TransportError>,
    ) {
        if epoch != self.connect_epoch {
            // A disconnect superseded this attempt
            if let Ok(mut transport) = result {
                transport.close().await;
            }
            return;
        }
        match result {
            Ok(transport) => {
                if self.machine.state() != ConnectionState::Connecting {
                    let mut transport = transport;
                    transport.close().await;
                    return;
                }
                self.transport = Some(transport);
                let now = self.time_source.now();
                let effects = self.machine.transport_opened(now);
                self.apply_effects(effects).await;
            }
            Err(error) => {
                warn!(%error, "transport open failed");
                let effects = self.machine.transport_closed(error.to_string());
                self.apply_effects(effects).await;
            }
        }
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => {
                // Inbound heartbeats are checked against the outstanding probe
                if let Some(client_sent_at) = heartbeat_ack(&text) {
                    let now = self.mono_now();
                    if let Some(hb) = self.heartbeat.as_mut() {
                        hb.confirm(client_sent_at, now);
                    }
                }
                let _ = self.inbound.send(text);
            }
            Some(TransportEvent::Closed { reason }) => {
                self.transport = None;
                let effects = self.machine.transport_closed(reason);
                self.apply_effects(effects).await;
            }
            None => {
                self.transport = None;
                let effects = self.machine.transport_closed("transport ended");
                self.apply_effects(effects).await;
            }
        }
    }

    async fn handle_wake(&mut self, kind: WakeKind) {
        match kind {
            WakeKind::Reconnect => {
                self.reconnect_at = None;
                let effects = self.machine.backoff_elapsed();
                self.apply_effects(effects).await;
            }
            WakeKind::Heartbeat => {
                let now = self.mono_now();
                let action = self.heartbeat.as_mut().map(|hb| hb.on_deadline(now));
                match action {
                    Some(HeartbeatAction::SendProbe) => self.send_heartbeat_probe().await,
                    Some(HeartbeatAction::Expired) => {
                        // Non-fatal: the probe cycle has re-armed; subscribers
                        // decide whether a missed ack warrants a reconnect
                        warn!("heartbeat ack missed");
                        self.bus.publish(BusEvent::HeartbeatLost);
                    }
                    None => {}
                }
            }
        }
    }

    async fn send_heartbeat_probe(&mut self) {
        let now = self.time_source.now();
        let probe = MessageEnvelope::heartbeat(now);
        let wire = envelope::serialize(&probe, now);
        if let Some(transport) = self.transport.as_mut() {
            if let Err(error) = transport.send(wire).await {
                // The transport will surface its own Closed event
                warn!(%error, "heartbeat send failed");
                return;
            }
            if let Some(hb) = self.heartbeat.as_mut() {
                hb.probe_sent(now.as_millis());
            }
            self.bus.publish(BusEvent::HeartbeatSent {
                sent_at_ms: now.as_millis(),
            });
        }
    }

    fn handle_quality_change(&mut self, level: QualityLevel) {
        let now = self.mono_now();
        let applied = self
            .adaptive
            .as_mut()
            .and_then(|adaptive| adaptive.on_quality_change(level, now));
        if let Some(interval_ms) = applied {
            if let Some(hb) = self.heartbeat.as_mut() {
                hb.set_interval(interval_ms, now);
            }
            self.bus
                .publish(BusEvent::AdaptiveHeartbeatChanged { interval_ms });
        }
    }

    async fn apply_effects(&mut self, effects: Vec<ConnectionEffect>) {
        let mut work: VecDeque<ConnectionEffect> = effects.into();
        while let Some(effect) = work.pop_front() {
            match effect {
                ConnectionEffect::OpenTransport => self.spawn_connect(),
                ConnectionEffect::CloseTransport => {
                    if let Some(mut transport) = self.transport.take() {
                        transport.close().await;
                    }
                    for follow_up in self.machine.transport_closed("client disconnect") {
                        work.push_back(follow_up);
                    }
                }
                ConnectionEffect::ScheduleReconnect { delay, .. } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                ConnectionEffect::CancelReconnect => self.reconnect_at = None,
                ConnectionEffect::StartHeartbeat => {
                    let interval_ms = self
                        .adaptive
                        .as_ref()
                        .map(AdaptiveHeartbeat::current_interval_ms)
                        .unwrap_or(self.machine.config().heartbeat_interval_ms);
                    let now = self.mono_now();
                    self.heartbeat = Some(HeartbeatState::start(interval_ms, now));
                }
                ConnectionEffect::StopHeartbeat => self.heartbeat = None,
                ConnectionEffect::Emit(signal) => self.bus.publish(signal.into()),
            }
        }
        self.publish_info();
    }

    fn spawn_connect(&mut self) {
        self.connect_epoch += 1;
        let epoch = self.connect_epoch;
        let connector = self.connector.clone();
        let url = self.url.clone();
        let results = self.conn_results_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = results.send((epoch, result));
        });
    }

    fn publish_info(&self) {
        let snapshot = self.machine.info().clone();
        match self.info.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

// ----------------------------------------------------------------------------
// Select Helpers
// ----------------------------------------------------------------------------

async fn next_transport_event(transport: &mut Option<BoxedTransport>) -> Option<TransportEvent> {
    match transport.as_mut() {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// `Some(clientSentAt)` when the frame is a heartbeat, `None` otherwise.
/// The timestamp may live in `payload` or at the top level.
fn heartbeat_ack(text: &str) -> Option<Option<u64>> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(Value::as_str) != Some(KIND_HEARTBEAT) {
        return None;
    }
    let sent_at = value
        .get("payload")
        .and_then(|payload| payload.get(envelope::FIELD_CLIENT_SENT_AT))
        .or_else(|| value.get(envelope::FIELD_CLIENT_SENT_AT))
        .and_then(Value::as_u64);
    Some(sent_at)
}
