use std::sync::Arc;

use shared::config::server::Config;

use crate::{
    gateway::registry::ConnectionRegistry,
    services::generation::{GenerationBackend, OllamaClient},
};

/// Application state shared across all routes and sessions.
#[derive(Clone)]
pub struct AppState {
    /// `None` only when the database is unavailable (degraded mode, tests).
    pub pool: Option<sqlx::PgPool>,
    pub config: Arc<Config>,
    /// The single connection registry every session task goes through.
    pub registry: Arc<ConnectionRegistry>,
    pub generation: Arc<dyn GenerationBackend>,
}

impl AppState {
    #[must_use]
    pub fn new(pool: Option<sqlx::PgPool>, config: Arc<Config>) -> Self {
        let generation: Arc<dyn GenerationBackend> =
            Arc::new(OllamaClient::new(config.generation.clone()));
        Self {
            pool,
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            generation,
        }
    }
}
