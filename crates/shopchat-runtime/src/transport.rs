//! Transport seams for the connection manager
//!
//! The connection actor drives any transport that can deliver text frames and
//! report its own closure. Implementations live outside this crate; tests use
//! scripted channel-backed transports.

use async_trait::async_trait;
use shopchat_core::TransportError;

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Inbound activity on an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived
    Message(String),
    /// The transport closed; no further events will be produced
    Closed { reason: String },
}

/// An open, bidirectional text-frame connection
#[async_trait]
pub trait Transport: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound event; `None` after `Closed` has been delivered
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close the transport; further sends fail
    async fn close(&mut self);
}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports on demand; owned by the connection actor and invoked for
/// the initial connect and every reconnect attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BoxedTransport, TransportError>;
}

// ----------------------------------------------------------------------------
// Channel Transport (test support)
// ----------------------------------------------------------------------------

/// Transport backed by tokio channels, for tests and local loopback
pub mod channel {
    use super::*;
    use tokio::sync::mpsc;

    /// Frames produced by [`ChannelTransport::send`]
    pub type OutboundReceiver = mpsc::UnboundedReceiver<String>;
    /// Feeds inbound events into the transport
    pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

    /// In-process transport; the test script owns both channel ends
    pub struct ChannelTransport {
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        closed: bool,
    }

    impl ChannelTransport {
        /// Build a transport plus the script-facing channel ends
        pub fn pair() -> (Self, InboundSender, OutboundReceiver) {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            (
                Self {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                    closed: false,
                },
                inbound_tx,
                outbound_rx,
            )
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::NotConnected);
            }
            self.outbound
                .send(text)
                .map_err(|_| TransportError::SendFailed {
                    reason: "peer dropped".to_string(),
                })
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            if self.closed {
                return None;
            }
            match self.inbound.recv().await {
                Some(event) => {
                    if matches!(event, TransportEvent::Closed { .. }) {
                        self.closed = true;
                    }
                    Some(event)
                }
                None => {
                    self.closed = true;
                    Some(TransportEvent::Closed {
                        reason: "script dropped".to_string(),
                    })
                }
            }
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }
}
