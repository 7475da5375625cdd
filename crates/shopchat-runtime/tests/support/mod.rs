//! Shared mocks for runtime integration tests

// Not every test crate uses every helper
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use shopchat_core::{BusEvent, HttpFailure, TransportError};
use shopchat_runtime::http::{HttpClient, MessagePost, UploadRequest, UploadResponse};
use shopchat_runtime::transport::channel::{ChannelTransport, InboundSender, OutboundReceiver};
use shopchat_runtime::transport::{BoxedTransport, Connector};
use tokio::sync::{broadcast, mpsc};

/// A freshly opened scripted link: feed frames in, observe frames out
pub struct Link {
    pub inbound: InboundSender,
    pub outbound: OutboundReceiver,
}

/// Connector producing channel transports; the first `fail_count` attempts
/// are rejected
pub struct ScriptedConnector {
    fail_count: AtomicU32,
    links: mpsc::UnboundedSender<Link>,
}

impl ScriptedConnector {
    pub fn new(fail_count: u32) -> (Self, mpsc::UnboundedReceiver<Link>) {
        let (links, link_rx) = mpsc::unbounded_channel();
        (
            Self {
                fail_count: AtomicU32::new(fail_count),
                links,
            },
            link_rx,
        )
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<BoxedTransport, TransportError> {
        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed {
                reason: "scripted refusal".to_string(),
            });
        }
        let (transport, inbound, outbound) = ChannelTransport::pair();
        let _ = self.links.send(Link { inbound, outbound });
        Ok(Box::new(transport))
    }
}

/// HTTP client with scripted failures and recorded requests
pub struct ScriptedHttp {
    fail_count: AtomicU32,
    failure: HttpFailure,
    /// Extra fields merged into the returned server message
    pub echo_temp_id: bool,
    pub posts: Mutex<Vec<MessagePost>>,
    pub uploads: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn succeeding() -> Self {
        Self::failing_n_times(0, HttpFailure::unreachable("unused"))
    }

    pub fn failing_n_times(count: u32, failure: HttpFailure) -> Self {
        Self {
            fail_count: AtomicU32::new(count),
            failure,
            echo_temp_id: true,
            posts: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn without_echo(mut self) -> Self {
        self.echo_temp_id = false;
        self
    }

    fn should_fail(&self) -> bool {
        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.store(remaining - 1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn post_message(&self, post: &MessagePost) -> Result<Value, HttpFailure> {
        if self.should_fail() {
            return Err(self.failure.clone());
        }
        self.posts.lock().unwrap().push(post.clone());
        let mut message = json!({
            "id": "srv-1",
            "type": post.kind,
            "content": post.content,
        });
        if self.echo_temp_id {
            message["temp_id"] = json!(post.temp_id);
        }
        Ok(message)
    }

    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, HttpFailure> {
        if self.should_fail() {
            return Err(self.failure.clone());
        }
        self.uploads.lock().unwrap().push(request.name.clone());
        Ok(UploadResponse {
            url: format!("https://cdn.example/{}", request.name),
        })
    }
}

/// Install a test subscriber once so failing tests show actor traces
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Receive bus events until the predicate matches, collecting along the way
pub async fn next_matching(
    rx: &mut broadcast::Receiver<BusEvent>,
    predicate: impl Fn(&BusEvent) -> bool,
) -> BusEvent {
    loop {
        let event = rx.recv().await.expect("bus closed");
        if predicate(&event) {
            return event;
        }
    }
}
