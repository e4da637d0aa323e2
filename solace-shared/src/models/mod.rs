pub mod chat;
pub mod frame;
pub mod generation;
pub mod user;

pub use chat::ChatMessage;
pub use frame::{ChatStreamRequest, ServerFrame};
pub use generation::GenerationRequest;
pub use user::{User, UserProfile};
