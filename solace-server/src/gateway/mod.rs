/// Real-time streaming chat gateway: connection bookkeeping and the
/// per-session protocol engine.
pub mod registry;
pub mod session;

pub use registry::{ConnectionRegistry, SessionHandle};
pub use session::{ChatSession, FrameSink, SessionError, SessionSettings};
