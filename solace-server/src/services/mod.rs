/// Service layer backing the gateway: durable records and generation.
pub mod generation;
pub mod message_service;

pub use generation::{FragmentStream, GenerationBackend, GenerationError, OllamaClient};
pub use message_service::{MessageStore, MessageStoreError, PgMessageStore};
