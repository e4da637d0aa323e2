//! OpenAPI document for the REST surface. The streaming channel itself is
//! documented in `gateway::session`; WebSocket exchanges are outside the
//! OpenAPI model.

use std::sync::Arc;

use axum::{Json, Router, routing::get};
use utoipa::OpenApi;

use crate::app_state::AppState;
use shared::models::chat::ChatMessage;

#[derive(OpenApi)]
#[openapi(
    paths(crate::handlers::history::chat_history),
    components(schemas(ChatMessage)),
    tags((name = "Chat", description = "Chat history and streaming sessions"))
)]
pub struct ApiDoc;

async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn openapi_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api-docs/openapi.json", get(serve_openapi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_includes_history_path() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/chat/history"));
    }
}
