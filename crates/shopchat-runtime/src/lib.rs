//! Shopchat Delivery Runtime
//!
//! Tokio orchestration for the shopchat delivery subsystem. Each component
//! runs as a single actor task owning its state exclusively; collaborators
//! communicate through command channels and the broadcast event bus, never by
//! sharing mutable state.
//!
//! The typical embedding wires a [`MessagingRuntime`] with an application
//! transport [`Connector`], an [`HttpClient`] for message persistence and
//! uploads, and a [`ConversationSource`] resolving the active conversation.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod bus;
pub mod connection;
pub mod http;
pub mod runtime;
pub mod send_channel;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use bus::BroadcastBus;
pub use connection::{ConnectionHandle, ConnectionManager};
pub use http::{HttpClient, MessagePost, UploadField, UploadRequest, UploadResponse};
pub use runtime::{MessagingRuntime, RuntimeConfig, RuntimeHandles};
pub use send_channel::{ConversationSource, SendChannel, SendChannelHandle, StaticConversation};
pub use transport::{BoxedTransport, Connector, Transport, TransportEvent};
