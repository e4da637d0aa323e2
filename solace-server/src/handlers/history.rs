//! Paginated chat history for the authenticated caller.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
};
use http::header;
use serde::Deserialize;
use tracing::warn;
use utoipa::IntoParams;

use shared::models::chat::ChatMessage;

use crate::{
    app_state::AppState,
    auth::TokenValidator,
    http::error::{ApiError, AppResult},
    services::message_service::{MessageStore, PgMessageStore},
};

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryParams {
    /// Rows to skip from the newest end.
    pub skip: Option<i64>,
    /// Page size, capped by `chat.history_page_size`.
    pub limit: Option<i64>,
}

/// The caller's messages, newest first.
#[utoipa::path(
    get,
    path = "/chat/history",
    params(HistoryParams),
    responses(
        (status = 200, description = "Messages retrieved", body = Vec<ChatMessage>),
        (status = 401, description = "Invalid or missing credential"),
        (status = 503, description = "Database unavailable")
    ),
    tag = "Chat"
)]
pub async fn chat_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::unauthorized("authentication required"))?;

    let pool = state
        .pool
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("database unavailable"))?;

    let validator = TokenValidator::new(state.config.auth.shared_secret.clone(), pool.clone());
    let user = validator.validate(token).await.map_err(|err| {
        warn!(error = %err, "history request denied");
        ApiError::from(err)
    })?;

    let skip = params.skip.unwrap_or(0);
    let page_size = state.config.chat.history_page_size;
    let limit = params.limit.unwrap_or(page_size).min(page_size);
    if skip < 0 || limit < 0 {
        return Err(ApiError::bad_request("pagination values must be non-negative"));
    }

    let store = PgMessageStore::new(pool);
    let messages = store.history(user.id, skip, limit).await?;
    Ok(Json(messages))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
