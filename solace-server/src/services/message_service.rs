//! Durable chat-message records backing the streaming gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use shared::models::{chat::ChatMessage, user::UserProfile};

/// Failures of the message store. Anything here is an internal fault for the
/// session that hits it.
#[derive(Debug, Error)]
pub enum MessageStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("message {0} not found")]
    NotFound(i64),
}

/// Store surface the gateway mutates: create a pending record, attach the
/// final response once, plus the two reads the gateway performs (history and
/// greeting profile).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates a pending record; the response stays unset until streaming
    /// ends.
    async fn create(
        &self,
        user_id: Uuid,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<ChatMessage, MessageStoreError>;

    /// Attaches the final (possibly partial, on failure) response text.
    async fn set_response(&self, message_id: i64, response: &str)
    -> Result<(), MessageStoreError>;

    /// The user's messages, newest first.
    async fn history(
        &self,
        user_id: Uuid,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, MessageStoreError>;

    /// Wellness-profile context for the greeting prompt, when present.
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, MessageStoreError>;
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    user_id: Uuid,
    message: String,
    response: Option<String>,
    metadata: Option<Value>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: row.id,
            user_id: row.user_id,
            message: row.message,
            response: row.response,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed message store.
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    #[instrument(name = "chat.create_message", skip(self, message, metadata), err)]
    async fn create(
        &self,
        user_id: Uuid,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<ChatMessage, MessageStoreError> {
        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO chat_messages (user_id, message, metadata)
             VALUES ($1, $2, $3)
             RETURNING id, user_id, message, response, metadata, created_at",
        )
        .bind(user_id)
        .bind(message)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    #[instrument(name = "chat.set_response", skip(self, response), err)]
    async fn set_response(
        &self,
        message_id: i64,
        response: &str,
    ) -> Result<(), MessageStoreError> {
        let result = sqlx::query("UPDATE chat_messages SET response = $2 WHERE id = $1")
            .bind(message_id)
            .bind(response)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MessageStoreError::NotFound(message_id));
        }
        Ok(())
    }

    #[instrument(name = "chat.history", skip(self), err)]
    async fn history(
        &self,
        user_id: Uuid,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, MessageStoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, user_id, message, response, metadata, created_at
             FROM chat_messages
             WHERE user_id = $1
             ORDER BY created_at DESC
             OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(name = "chat.profile", skip(self), err)]
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, MessageStoreError> {
        #[derive(sqlx::FromRow)]
        struct ProfileRow {
            current_mood: Option<String>,
            primary_concerns: Option<String>,
            coping_strategies: Option<String>,
        }

        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT current_mood, primary_concerns, coping_strategies
             FROM user_profiles
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| UserProfile {
            current_mood: row.current_mood,
            primary_concerns: row.primary_concerns,
            coping_strategies: row.coping_strategies,
        }))
    }
}
