//! End-to-end exercises of the session protocol engine against a scripted
//! generation backend, an in-memory message store, and a recording sink.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use serde_json::{Value, json};
use uuid::Uuid;

use server::{
    gateway::{
        registry::ConnectionRegistry,
        session::{ChatSession, FrameSink, SessionError, SessionPhase, SessionSettings},
    },
    services::{
        generation::{FragmentStream, GenerationBackend, GenerationError},
        message_service::{MessageStore, MessageStoreError},
    },
};
use shared::models::{
    chat::ChatMessage,
    frame::ServerFrame,
    generation::GenerationRequest,
    user::{User, UserProfile},
};

#[derive(Default)]
struct InMemoryStore {
    next_id: AtomicI64,
    records: Mutex<HashMap<i64, ChatMessage>>,
}

impl InMemoryStore {
    fn record(&self, id: i64) -> Option<ChatMessage> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create(
        &self,
        user_id: Uuid,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<ChatMessage, MessageStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ChatMessage {
            id,
            user_id,
            message: message.to_string(),
            response: None,
            metadata,
            created_at: Utc::now(),
        };
        self.records.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }

    async fn set_response(
        &self,
        message_id: i64,
        response: &str,
    ) -> Result<(), MessageStoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&message_id)
            .ok_or(MessageStoreError::NotFound(message_id))?;
        record.response = Some(response.to_string());
        Ok(())
    }

    async fn history(
        &self,
        user_id: Uuid,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, MessageStoreError> {
        let mut messages: Vec<ChatMessage> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(messages
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn profile(&self, _user_id: Uuid) -> Result<Option<UserProfile>, MessageStoreError> {
        Ok(None)
    }
}

/// One scripted generation exchange.
enum Script {
    Fragments(Vec<&'static str>),
    FailAfter(Vec<&'static str>),
    FailToStart,
}

struct ScriptedBackend {
    scripts: Mutex<Vec<Script>>,
}

impl ScriptedBackend {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn stream(&self, _request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            assert!(!scripts.is_empty(), "backend called more times than scripted");
            scripts.remove(0)
        };

        match script {
            Script::FailToStart => Err(GenerationError::Status(500)),
            Script::Fragments(parts) => {
                let items: Vec<Result<String, GenerationError>> =
                    parts.into_iter().map(|part| Ok(part.to_string())).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Script::FailAfter(parts) => {
                let mut items: Vec<Result<String, GenerationError>> =
                    parts.into_iter().map(|part| Ok(part.to_string())).collect();
                items.push(Err(GenerationError::Transport("connection reset".into())));
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

/// Records frames; optionally starts failing once `fail_after` frames have
/// been delivered, standing in for a dead transport.
#[derive(Default)]
struct RecordingSink {
    frames: Vec<ServerFrame>,
    fail_after: Option<usize>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), SessionError> {
        if let Some(limit) = self.fail_after
            && self.frames.len() >= limit
        {
            return Err(SessionError::TransportClosed);
        }
        self.frames.push(frame);
        Ok(())
    }
}

fn test_user() -> User {
    User {
        id: Uuid::new_v4(),
        username: "ada".into(),
        is_active: true,
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        chunk_delay: Duration::ZERO,
        greeting_prompt: None,
    }
}

struct Harness {
    session: ChatSession,
    store: Arc<InMemoryStore>,
    registry: Arc<ConnectionRegistry>,
    user: User,
}

fn harness(scripts: Vec<Script>, settings: SessionSettings) -> Harness {
    let user = test_user();
    let store = Arc::new(InMemoryStore::default());
    let registry = Arc::new(ConnectionRegistry::new());
    let session = ChatSession::new(
        user.clone(),
        store.clone(),
        Arc::new(ScriptedBackend::new(scripts)),
        registry.clone(),
        settings,
    );
    Harness {
        session,
        store,
        registry,
        user,
    }
}

#[tokio::test]
async fn connected_frame_precedes_everything() {
    let mut h = harness(vec![], settings());
    let mut sink = RecordingSink::default();

    h.session.open(&mut sink).await.unwrap();

    assert_eq!(sink.frames, vec![ServerFrame::connected()]);
    assert_eq!(h.session.phase(), SessionPhase::AwaitingRequest);

    let current = h.registry.current(h.user.id).await.unwrap();
    assert_eq!(current.session_id, h.session.session_id());
}

#[tokio::test]
async fn request_streams_chunks_in_order_and_persists() {
    let mut h = harness(
        vec![Script::Fragments(vec!["Hel", "lo", "!"])],
        settings(),
    );
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, r#"{"message":"hi"}"#)
        .await
        .unwrap();

    assert_eq!(
        sink.frames,
        vec![
            ServerFrame::connected(),
            ServerFrame::Start { message_id: 1 },
            ServerFrame::Chunk {
                message_id: 1,
                chunk: "Hel".into()
            },
            ServerFrame::Chunk {
                message_id: 1,
                chunk: "lo".into()
            },
            ServerFrame::Chunk {
                message_id: 1,
                chunk: "!".into()
            },
            ServerFrame::End { message_id: 1 },
        ]
    );

    let record = h.store.record(1).unwrap();
    assert_eq!(record.message, "hi");
    assert_eq!(record.user_id, h.user.id);
    assert_eq!(record.response.as_deref(), Some("Hello!"));
    assert_eq!(h.session.phase(), SessionPhase::AwaitingRequest);
}

#[tokio::test]
async fn empty_message_is_rejected_without_a_record() {
    let mut h = harness(vec![Script::Fragments(vec!["ok"])], settings());
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, r#"{"message":""}"#)
        .await
        .unwrap();

    assert_eq!(
        sink.frames.last().unwrap(),
        &ServerFrame::error("Message is required")
    );
    assert_eq!(h.store.len(), 0);

    // The session stays in AwaitingRequest and serves the next request.
    h.session
        .handle_text(&mut sink, r#"{"message":"hi"}"#)
        .await
        .unwrap();
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.store.record(1).unwrap().response.as_deref(), Some("ok"));
}

#[tokio::test]
async fn missing_message_field_is_rejected() {
    let mut h = harness(vec![], settings());
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, r#"{"temperature":0.3}"#)
        .await
        .unwrap();

    assert_eq!(
        sink.frames.last().unwrap(),
        &ServerFrame::error("Message is required")
    );
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn unparseable_frame_is_rejected_without_a_record() {
    let mut h = harness(vec![], settings());
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, "not json at all")
        .await
        .unwrap();

    assert_eq!(
        sink.frames.last().unwrap(),
        &ServerFrame::error("invalid input")
    );
    assert_eq!(h.store.len(), 0);
}

#[tokio::test]
async fn backend_failure_saves_partial_and_keeps_session_usable() {
    let mut h = harness(
        vec![
            Script::FailAfter(vec!["par", "tial"]),
            Script::Fragments(vec!["ok"]),
        ],
        settings(),
    );
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, r#"{"message":"first"}"#)
        .await
        .unwrap();

    match sink.frames.last().unwrap() {
        ServerFrame::Error { message_id, error } => {
            assert_eq!(*message_id, Some(1));
            assert!(error.contains("connection reset"));
        }
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(
        h.store.record(1).unwrap().response.as_deref(),
        Some("partial")
    );
    assert_eq!(h.session.phase(), SessionPhase::AwaitingRequest);

    h.session
        .handle_text(&mut sink, r#"{"message":"second"}"#)
        .await
        .unwrap();

    assert_eq!(sink.frames.last().unwrap(), &ServerFrame::End { message_id: 2 });
    assert_eq!(h.store.record(2).unwrap().response.as_deref(), Some("ok"));
}

#[tokio::test]
async fn backend_failing_to_start_still_finalizes_the_record() {
    let mut h = harness(vec![Script::FailToStart], settings());
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    h.session
        .handle_text(&mut sink, r#"{"message":"hi"}"#)
        .await
        .unwrap();

    // Zero fragments accumulated: the record is finalized with empty text.
    assert_eq!(h.store.record(1).unwrap().response.as_deref(), Some(""));
    assert!(matches!(
        sink.frames.last().unwrap(),
        ServerFrame::Error {
            message_id: Some(1),
            ..
        }
    ));
}

#[tokio::test]
async fn transport_loss_mid_stream_persists_partial_and_unwinds() {
    let mut h = harness(
        vec![Script::Fragments(vec!["Hel", "lo", "!"])],
        settings(),
    );
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    // Allow system, start, and the first chunk; fail on the second chunk.
    sink.fail_after = Some(3);

    let result = h
        .session
        .handle_text(&mut sink, r#"{"message":"hi"}"#)
        .await;
    assert!(matches!(result, Err(SessionError::TransportClosed)));

    // The fragment that could not be delivered is still part of the save.
    assert_eq!(
        h.store.record(1).unwrap().response.as_deref(),
        Some("Hello")
    );

    h.session.close().await;
    assert_eq!(h.session.phase(), SessionPhase::Closed);
    assert!(h.registry.current(h.user.id).await.is_none());
}

#[tokio::test]
async fn greeting_cycle_streams_and_marks_the_record() {
    let mut config_settings = settings();
    config_settings.greeting_prompt = Some("Welcome prompt".into());

    let mut h = harness(vec![Script::Fragments(vec!["Hi", "!"])], config_settings);
    let mut sink = RecordingSink::default();
    h.session.open(&mut sink).await.unwrap();

    assert_eq!(
        sink.frames,
        vec![
            ServerFrame::connected(),
            ServerFrame::Start { message_id: 1 },
            ServerFrame::Chunk {
                message_id: 1,
                chunk: "Hi".into()
            },
            ServerFrame::Chunk {
                message_id: 1,
                chunk: "!".into()
            },
            ServerFrame::End { message_id: 1 },
        ]
    );

    let record = h.store.record(1).unwrap();
    assert_eq!(record.message, "Welcome prompt");
    assert_eq!(record.response.as_deref(), Some("Hi!"));
    assert_eq!(
        record.metadata,
        Some(json!({ "system_generated": true, "kind": "greeting" }))
    );
}

#[tokio::test]
async fn greeting_failure_does_not_block_the_session() {
    let mut config_settings = settings();
    config_settings.greeting_prompt = Some("Welcome prompt".into());

    let mut h = harness(
        vec![Script::FailToStart, Script::Fragments(vec!["ok"])],
        config_settings,
    );
    let mut sink = RecordingSink::default();

    h.session.open(&mut sink).await.unwrap();
    assert_eq!(h.session.phase(), SessionPhase::AwaitingRequest);
    assert!(matches!(
        sink.frames.last().unwrap(),
        ServerFrame::Error {
            message_id: Some(1),
            ..
        }
    ));

    h.session
        .handle_text(&mut sink, r#"{"message":"hi"}"#)
        .await
        .unwrap();
    assert_eq!(h.store.record(2).unwrap().response.as_deref(), Some("ok"));
}

#[tokio::test]
async fn admitting_a_second_session_keeps_the_newest_only() {
    let user = test_user();
    let registry = Arc::new(ConnectionRegistry::new());
    let store = Arc::new(InMemoryStore::default());

    let mut first = ChatSession::new(
        user.clone(),
        store.clone(),
        Arc::new(ScriptedBackend::new(vec![])),
        registry.clone(),
        settings(),
    );
    let mut second = ChatSession::new(
        user.clone(),
        store.clone(),
        Arc::new(ScriptedBackend::new(vec![])),
        registry.clone(),
        settings(),
    );

    let mut sink = RecordingSink::default();
    first.open(&mut sink).await.unwrap();
    second.open(&mut sink).await.unwrap();

    let current = registry.current(user.id).await.unwrap();
    assert_eq!(current.session_id, second.session_id());

    // The superseded session's late unwind must not evict the replacement.
    first.close().await;
    let current = registry.current(user.id).await.unwrap();
    assert_eq!(current.session_id, second.session_id());

    second.close().await;
    assert!(registry.current(user.id).await.is_none());
}
