//! Session protocol engine for the streaming chat channel.
//!
//! One WebSocket per authenticated user. The credential travels in the
//! connection path; after validation the session registers itself, optionally
//! runs a greeting cycle, then loops: receive a request frame, create the
//! pending message record, relay the generation stream chunk-by-chunk while
//! accumulating the full text, and finalize the record.
//!
//! ## Protocol
//!
//! Client → server, one JSON object per text frame:
//!
//! ```json
//! {"message":"hi","temperature":0.4,"top_p":0.9,"max_tokens":256}
//! ```
//!
//! Server → client (see [`ServerFrame`]):
//!
//! ```json
//! {"type":"system","message":"connected"}
//! {"type":"start","message_id":7}
//! {"type":"chunk","message_id":7,"chunk":"Hel"}
//! {"type":"end","message_id":7}
//! {"type":"error","error":"invalid input"}
//! ```
//!
//! A generation failure keeps the session alive: whatever text accumulated is
//! saved, an error frame goes out, and the session waits for the next
//! request. Only transport loss, authentication failure, or a store fault
//! tear the session down.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use futures_util::StreamExt;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    config::server::Config,
    models::{
        frame::{ChatStreamRequest, ServerFrame},
        generation::GenerationRequest,
        user::{User, UserProfile},
    },
};

use crate::{
    app_state::AppState,
    auth::TokenValidator,
    gateway::registry::{ConnectionRegistry, SessionHandle},
    services::{
        generation::{GenerationBackend, GenerationError},
        message_service::{MessageStore, MessageStoreError, PgMessageStore},
    },
};

/// Lifecycle phase of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticating,
    Authenticated,
    AwaitingRequest,
    Streaming,
    Closed,
}

/// Terminal session failures. Generation failures never appear here; they are
/// absorbed inside the request cycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport closed")]
    TransportClosed,
    #[error(transparent)]
    Store(#[from] MessageStoreError),
}

/// Outbound half of the session transport. The engine is written against
/// this so tests can drive it without sockets; an error from `send` means
/// the transport is gone and no further frames may be attempted.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), SessionError>;
}

/// Per-session knobs derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Pacing delay between relayed chunks.
    pub chunk_delay: Duration,
    /// Fully built greeting prompt; `None` disables the greeting cycle.
    pub greeting_prompt: Option<String>,
}

impl SessionSettings {
    /// Settings for `user` per `config`, with the greeting prompt enhanced
    /// by the user's wellness profile.
    #[must_use]
    pub fn for_user(config: &Config, profile: Option<&UserProfile>) -> Self {
        let greeting_prompt = (config.chat.greeting_enabled
            && !config.chat.greeting_prompt.is_empty())
        .then(|| enhance_greeting(&config.chat.greeting_prompt, profile));

        Self {
            chunk_delay: Duration::from_millis(config.generation.chunk_delay_ms),
            greeting_prompt,
        }
    }
}

/// Folds profile context into the base greeting prompt.
fn enhance_greeting(base: &str, profile: Option<&UserProfile>) -> String {
    let Some(profile) = profile.filter(|profile| !profile.is_empty()) else {
        return base.to_string();
    };

    let mut prompt = format!("{base}\n\nUSER CONTEXT:\n");
    if let Some(mood) = &profile.current_mood {
        prompt.push_str(&format!("- Current mood: {mood}\n"));
    }
    if let Some(concerns) = &profile.primary_concerns {
        prompt.push_str(&format!("- Primary concerns: {concerns}\n"));
    }
    if let Some(strategies) = &profile.coping_strategies {
        prompt.push_str(&format!("- Coping strategies tried: {strategies}\n"));
    }
    prompt.push_str("\nPlease consider this context in your responses.");
    prompt
}

/// How one request cycle ended, short of tearing the session down.
enum CycleFailure {
    Backend(GenerationError),
    Transport,
}

/// The state machine governing one authenticated channel.
pub struct ChatSession {
    user: User,
    session_id: Uuid,
    store: Arc<dyn MessageStore>,
    backend: Arc<dyn GenerationBackend>,
    registry: Arc<ConnectionRegistry>,
    settings: SessionSettings,
    phase: SessionPhase,
}

impl ChatSession {
    pub fn new(
        user: User,
        store: Arc<dyn MessageStore>,
        backend: Arc<dyn GenerationBackend>,
        registry: Arc<ConnectionRegistry>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            user,
            session_id: Uuid::new_v4(),
            store,
            backend,
            registry,
            settings,
            phase: SessionPhase::Connecting,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Registers the session, emits the connected notification, and runs the
    /// greeting cycle when configured. On success the session is in
    /// `AwaitingRequest`.
    ///
    /// # Errors
    /// Fails only on transport loss or a store fault; a greeting generation
    /// failure is absorbed like any other backend failure.
    pub async fn open<S: FrameSink>(&mut self, sink: &mut S) -> Result<(), SessionError> {
        self.phase = SessionPhase::Authenticated;
        let superseded = self
            .registry
            .admit(
                self.user.id,
                SessionHandle {
                    session_id: self.session_id,
                },
            )
            .await;
        if superseded.is_some() {
            // The old session is left to notice on its next write.
            info!(user_id = %self.user.id, "replaced an existing session");
        }

        sink.send(ServerFrame::connected()).await?;

        if let Some(prompt) = self.settings.greeting_prompt.clone() {
            let request = GenerationRequest::from_prompt(prompt.clone());
            let metadata = json!({ "system_generated": true, "kind": "greeting" });
            self.run_cycle(sink, &prompt, request, Some(metadata))
                .await?;
        }

        self.phase = SessionPhase::AwaitingRequest;
        Ok(())
    }

    /// Handles one inbound text frame while in `AwaitingRequest`.
    ///
    /// # Errors
    /// Fails only on transport loss or a store fault; malformed input and
    /// backend failures are answered with error frames and leave the session
    /// waiting for the next request.
    pub async fn handle_text<S: FrameSink>(
        &mut self,
        sink: &mut S,
        raw: &str,
    ) -> Result<(), SessionError> {
        let request: ChatStreamRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(_) => {
                sink.send(ServerFrame::error("invalid input")).await?;
                return Ok(());
            }
        };

        if request.message.trim().is_empty() {
            sink.send(ServerFrame::error("Message is required")).await?;
            return Ok(());
        }

        let generation = GenerationRequest {
            prompt: request.message.clone(),
            system_prompt: request.system_prompt,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
        };

        self.run_cycle(sink, &request.message, generation, None).await
    }

    /// One create → stream → finalize cycle, shared by caller requests and
    /// the greeting. The record exists before `start` goes out, and exactly
    /// one terminal frame follows the chunks.
    async fn run_cycle<S: FrameSink>(
        &mut self,
        sink: &mut S,
        record_text: &str,
        request: GenerationRequest,
        metadata: Option<Value>,
    ) -> Result<(), SessionError> {
        let message = self
            .store
            .create(self.user.id, record_text, metadata)
            .await?;

        self.phase = SessionPhase::Streaming;
        // Transport loss here leaves nothing accumulated, so nothing to save.
        sink.send(ServerFrame::Start {
            message_id: message.id,
        })
        .await?;

        let mut accumulated = String::new();
        let outcome = self.drain_stream(sink, message.id, request, &mut accumulated).await;

        match outcome {
            Ok(()) => {
                self.store.set_response(message.id, &accumulated).await?;
                sink.send(ServerFrame::End {
                    message_id: message.id,
                })
                .await?;
            }
            Err(CycleFailure::Backend(err)) => {
                metrics::counter!("solace_generation_failures_total").increment(1);
                warn!(
                    user_id = %self.user.id,
                    message_id = message.id,
                    error = %err,
                    "generation failed mid-stream; saving partial response"
                );
                self.save_partial(message.id, &accumulated).await;
                sink.send(ServerFrame::message_error(message.id, err.to_string()))
                    .await?;
            }
            Err(CycleFailure::Transport) => {
                self.save_partial(message.id, &accumulated).await;
                return Err(SessionError::TransportClosed);
            }
        }

        self.phase = SessionPhase::AwaitingRequest;
        Ok(())
    }

    /// Relays fragments in production order, accumulating the full text.
    async fn drain_stream<S: FrameSink>(
        &mut self,
        sink: &mut S,
        message_id: i64,
        request: GenerationRequest,
        accumulated: &mut String,
    ) -> Result<(), CycleFailure> {
        let mut stream = self
            .backend
            .stream(request)
            .await
            .map_err(CycleFailure::Backend)?;

        while let Some(item) = stream.next().await {
            let fragment = item.map_err(CycleFailure::Backend)?;
            accumulated.push_str(&fragment);
            sink.send(ServerFrame::Chunk {
                message_id,
                chunk: fragment,
            })
            .await
            .map_err(|_| CycleFailure::Transport)?;

            if !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }

        Ok(())
    }

    /// Best-effort partial save; the session outcome does not depend on it.
    async fn save_partial(&self, message_id: i64, accumulated: &str) {
        if let Err(err) = self.store.set_response(message_id, accumulated).await {
            warn!(
                user_id = %self.user.id,
                message_id,
                error = %err,
                "failed to save partial response"
            );
        }
    }

    /// Deregisters the session and releases its registry slot. Idempotent;
    /// no frames are sent past this point.
    pub async fn close(&mut self) {
        self.registry.remove(self.user.id, self.session_id).await;
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closed;
            info!(user_id = %self.user.id, session_id = %self.session_id, "session closed");
        }
    }
}

/// [`FrameSink`] over an axum WebSocket.
struct WsFrameSink<'a> {
    socket: &'a mut WebSocket,
}

#[async_trait]
impl FrameSink for WsFrameSink<'_> {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), SessionError> {
        let text = serde_json::to_string(&frame).unwrap_or_default();
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| SessionError::TransportClosed)
    }
}

/// `GET /api/chat/ws/{token}` — upgrades to the streaming chat channel.
/// The bearer credential rides in the path, as browser WebSocket clients
/// cannot set headers.
pub async fn chat_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, token: String) {
    let Some(pool) = state.pool.clone() else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: "service unavailable".into(),
            })))
            .await;
        return;
    };

    // Authenticating. Every failure mode collapses to the same denial.
    let validator = TokenValidator::new(state.config.auth.shared_secret.clone(), pool.clone());
    let user = match validator.validate(&token).await {
        Ok(user) => user,
        Err(err) => {
            metrics::counter!("solace_auth_denials_total").increment(1);
            warn!(error = %err, "websocket authentication denied");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));
    let profile = match store.profile(user.id).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!(user_id = %user.id, error = %err, "profile lookup failed; greeting without context");
            None
        }
    };
    let settings = SessionSettings::for_user(&state.config, profile.as_ref());

    let mut session = ChatSession::new(
        user,
        store,
        state.generation.clone(),
        state.registry.clone(),
        settings,
    );
    metrics::counter!("solace_sessions_opened_total").increment(1);

    let opened = {
        let mut sink = WsFrameSink {
            socket: &mut socket,
        };
        session.open(&mut sink).await
    };
    if let Err(err) = opened {
        report_fault(&mut socket, &err).await;
        session.close().await;
        return;
    }

    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let mut sink = WsFrameSink {
                    socket: &mut socket,
                };
                if let Err(err) = session.handle_text(&mut sink, text.as_str()).await {
                    report_fault(&mut socket, &err).await;
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let mut sink = WsFrameSink {
                    socket: &mut socket,
                };
                if sink.send(ServerFrame::error("invalid input")).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {} // ping/pong are answered by the transport layer
        }
    }

    session.close().await;
}

/// Store faults get one best-effort generic error frame while the transport
/// may still be alive; transport loss gets nothing.
async fn report_fault(socket: &mut WebSocket, err: &SessionError) {
    if let SessionError::Store(err) = err {
        warn!(error = %err, "session store fault; closing");
        let frame = serde_json::to_string(&ServerFrame::error("internal error")).unwrap_or_default();
        let _ = socket.send(Message::Text(frame.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_without_profile_is_base_prompt() {
        assert_eq!(enhance_greeting("Hello.", None), "Hello.");
        assert_eq!(
            enhance_greeting("Hello.", Some(&UserProfile::default())),
            "Hello."
        );
    }

    #[test]
    fn greeting_includes_profile_context() {
        let profile = UserProfile {
            current_mood: Some("anxious".into()),
            primary_concerns: Some("work stress".into()),
            coping_strategies: None,
        };
        let prompt = enhance_greeting("Hello.", Some(&profile));
        assert!(prompt.starts_with("Hello.\n\nUSER CONTEXT:\n"));
        assert!(prompt.contains("- Current mood: anxious"));
        assert!(prompt.contains("- Primary concerns: work stress"));
        assert!(!prompt.contains("Coping strategies"));
        assert!(prompt.ends_with("Please consider this context in your responses."));
    }

    #[test]
    fn settings_respect_greeting_flag() {
        let mut config = Config::with_defaults();
        config.chat.greeting_enabled = false;
        let settings = SessionSettings::for_user(&config, None);
        assert!(settings.greeting_prompt.is_none());

        config.chat.greeting_enabled = true;
        let settings = SessionSettings::for_user(&config, None);
        assert_eq!(
            settings.greeting_prompt.as_deref(),
            Some(config.chat.greeting_prompt.as_str())
        );
    }
}
