//! HTTP delivery seam
//!
//! Message persistence and binary uploads go over an application-provided
//! HTTP client. The send channel only sees this trait; the two concrete
//! endpoints it models are `POST /api/messages` and `POST /api/upload`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shopchat_core::{ConversationId, HttpFailure};

// ----------------------------------------------------------------------------
// Request and Response Types
// ----------------------------------------------------------------------------

/// Body of a message persistence request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePost {
    pub conversation_id: ConversationId,
    /// Echoed back by the server for optimistic-UI reconciliation
    pub temp_id: String,
    /// `text`, `file`, or `voice`
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific content: text body, or the uploaded resource descriptor
    pub content: Value,
}

/// Which multipart field carries the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadField {
    File,
    Audio,
}

/// A binary upload request (phase one of a file/voice send)
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub field: UploadField,
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

// ----------------------------------------------------------------------------
// Client Seam
// ----------------------------------------------------------------------------

/// Application-provided HTTP client used by the send channel
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Persist a message; the returned value is the authoritative server
    /// message (including the echoed `temp_id`)
    async fn post_message(&self, post: &MessagePost) -> Result<Value, HttpFailure>;

    /// Upload a binary; failures here stop the send before phase two
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, HttpFailure>;
}
