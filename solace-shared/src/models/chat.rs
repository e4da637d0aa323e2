use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// One unit of conversation: the caller's request text plus the assistant's
/// response once streaming has finished.
///
/// The request text is set at creation and never mutated. The response starts
/// out `None` and is written exactly once when the stream drains or
/// definitively fails (a partial best-effort save counts as that one write).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatMessage {
    /// Surrogate id assigned by the store on creation.
    pub id: i64,
    /// Owning user.
    pub user_id: Uuid,
    /// Request text as submitted by the caller (or the greeting prompt).
    pub message: String,
    /// Assistant response; `None` until streaming completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Opaque payload, e.g. marking system-generated greetings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Assigned by the store on creation.
    pub created_at: DateTime<Utc>,
}
