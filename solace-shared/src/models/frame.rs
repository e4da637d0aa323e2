//! Framing contract for the streaming chat channel.
//!
//! All traffic is JSON, one object per transport message.
//!
//! Client → server:
//!
//! ```json
//! {"message":"how do I calm down before a talk?","temperature":0.5}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"type":"system","message":"connected"}
//! {"type":"start","message_id":7}
//! {"type":"chunk","message_id":7,"chunk":"Hel"}
//! {"type":"end","message_id":7}
//! {"type":"error","error":"Message is required"}
//! ```

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One request frame from the caller.
///
/// `message` is required and must be non-empty; the engine rejects the frame
/// without creating a record otherwise. Sampling fields fall back to the
/// configured defaults when absent.
#[derive(Debug, Clone, Deserialize, PartialEq, ToSchema)]
pub struct ChatStreamRequest {
    /// Request text. Deserializes to empty when missing so the engine can
    /// answer with a domain error instead of a parse error.
    #[serde(default)]
    pub message: String,
    /// Optional system context forwarded to the generation backend.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One frame emitted by the gateway over the session channel.
///
/// For a given message: `start` precedes every `chunk`, which precede exactly
/// one terminal `end` or `error`, all in generation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection-level notification, sent once after authentication.
    System { message: String },
    /// A message record exists; subsequent frames carry this id.
    Start { message_id: i64 },
    /// One generated fragment, relayed in production order.
    Chunk { message_id: i64, chunk: String },
    /// Stream drained and the response was persisted.
    End { message_id: i64 },
    /// Recoverable failure; `message_id` is present when a record exists.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
        error: String,
    },
}

impl ServerFrame {
    /// Connection acknowledgement emitted right after authentication.
    #[must_use]
    pub fn connected() -> Self {
        ServerFrame::System {
            message: "connected".into(),
        }
    }

    /// Error frame not tied to any message record.
    pub fn error(text: impl Into<String>) -> Self {
        ServerFrame::Error {
            message_id: None,
            error: text.into(),
        }
    }

    /// Error frame tied to an existing message record.
    pub fn message_error(message_id: i64, text: impl Into<String>) -> Self {
        ServerFrame::Error {
            message_id: Some(message_id),
            error: text.into(),
        }
    }
}
