//! Schema bootstrap and database health probes.
//!
//! The gateway owns three tables; the DDL is embedded and idempotent, so a
//! fresh database becomes usable on first start.

use std::sync::Mutex;

use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
         id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
         username TEXT NOT NULL UNIQUE,
         is_active BOOLEAN NOT NULL DEFAULT TRUE,
         created_at TIMESTAMPTZ NOT NULL DEFAULT now()
     )",
    "CREATE TABLE IF NOT EXISTS user_profiles (
         user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
         current_mood TEXT,
         primary_concerns TEXT,
         coping_strategies TEXT
     )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
         id BIGSERIAL PRIMARY KEY,
         user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
         message TEXT NOT NULL,
         response TEXT,
         metadata JSONB,
         created_at TIMESTAMPTZ NOT NULL DEFAULT now()
     )",
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_user_created
         ON chat_messages (user_id, created_at DESC)",
];

/// Applies the embedded schema.
///
/// # Errors
/// Returns the first statement failure.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database bootstrap complete");
    Ok(())
}

/// Cheapest possible connectivity probe.
///
/// # Errors
/// Fails when the database cannot answer a trivial query.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

static READINESS_OVERRIDE: Mutex<Option<bool>> = Mutex::new(None);

/// Forces the readiness outcome; used by route tests.
pub fn set_readiness_override(value: Option<bool>) {
    *READINESS_OVERRIDE
        .lock()
        .expect("readiness override mutex poisoned") = value;
}

/// Verifies the schema is present and reachable.
///
/// # Errors
/// Fails when the database is unreachable or not yet bootstrapped.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    let overridden = *READINESS_OVERRIDE
        .lock()
        .expect("readiness override mutex poisoned");
    if let Some(ready) = overridden {
        return if ready {
            Ok(())
        } else {
            Err(sqlx::Error::PoolClosed)
        };
    }

    let present: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('chat_messages')::text")
            .fetch_one(pool)
            .await?;
    if present.is_none() {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}
