//! WebSocket transport for the shopchat delivery runtime
//!
//! Adapts a `tokio-tungstenite` client stream onto the runtime's
//! [`Transport`] seam. Text frames map one to one; binary frames are decoded
//! as UTF-8 text; control frames are handled by the websocket layer.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shopchat_core::TransportError;
use shopchat_runtime::transport::{BoxedTransport, Connector, Transport, TransportEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// Opens `ws://` / `wss://` connections for the connection manager
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<BoxedTransport, TransportError> {
        let parsed = Url::parse(url).map_err(|err| TransportError::ConnectionFailed {
            reason: format!("invalid url: {err}"),
        })?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::ConnectionFailed {
                    reason: format!("unsupported scheme: {other}"),
                })
            }
        }

        let (stream, response) =
            connect_async(url)
                .await
                .map_err(|err| TransportError::ConnectionFailed {
                    reason: err.to_string(),
                })?;
        debug!(status = %response.status(), %url, "websocket connected");
        Ok(Box::new(WsTransport {
            stream,
            closed: false,
        }))
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// A live websocket connection
pub struct WsTransport {
    stream: WsStream,
    closed: bool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::SendFailed {
                reason: err.to_string(),
            })
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => {
                    if let Some(event) = map_message(message) {
                        if matches!(event, TransportEvent::Closed { .. }) {
                            self.closed = true;
                        }
                        return Some(event);
                    }
                    // Control frame; keep reading
                }
                Some(Err(err)) => {
                    self.closed = true;
                    return Some(TransportEvent::Closed {
                        reason: err.to_string(),
                    });
                }
                None => {
                    self.closed = true;
                    return Some(TransportEvent::Closed {
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.close(None).await;
        }
    }
}

/// Map a websocket frame onto a transport event; control frames map to `None`
fn map_message(message: Message) -> Option<TransportEvent> {
    match message {
        Message::Text(text) => Some(TransportEvent::Message(text)),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(TransportEvent::Message(text)),
            Err(_) => {
                debug!("dropping non-utf8 binary frame");
                None
            }
        },
        Message::Close(frame) => Some(TransportEvent::Closed {
            reason: frame
                .map(|f| f.reason.to_string())
                .unwrap_or_else(|| "closed by peer".to_string()),
        }),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_maps_to_message() {
        let event = map_message(Message::Text("{\"type\":\"ping\"}".to_string()));
        assert_eq!(
            event,
            Some(TransportEvent::Message("{\"type\":\"ping\"}".to_string()))
        );
    }

    #[test]
    fn test_binary_utf8_decodes() {
        let event = map_message(Message::Binary(b"hello".to_vec()));
        assert_eq!(event, Some(TransportEvent::Message("hello".to_string())));
        assert_eq!(map_message(Message::Binary(vec![0xff, 0xfe])), None);
    }

    #[test]
    fn test_close_frame_carries_reason() {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let event = map_message(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "going away".into(),
        })));
        assert_eq!(
            event,
            Some(TransportEvent::Closed {
                reason: "going away".to_string()
            })
        );

        let event = map_message(Message::Close(None));
        assert_eq!(
            event,
            Some(TransportEvent::Closed {
                reason: "closed by peer".to_string()
            })
        );
    }

    #[test]
    fn test_control_frames_ignored() {
        assert_eq!(map_message(Message::Ping(vec![])), None);
        assert_eq!(map_message(Message::Pong(vec![])), None);
    }
}
