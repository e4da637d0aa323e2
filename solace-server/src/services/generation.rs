//! Streaming client for the text-generation backend.
//!
//! The backend speaks an Ollama-style chat API: one POST with `stream: true`,
//! answered with newline-delimited JSON objects over a chunked body. A single
//! network read may carry zero, one, several, or a partial object, so bytes
//! are reassembled in a buffer and a fragment is only yielded once a complete
//! object parses. The final object carries `done: true`; reading stops there
//! rather than waiting for the transport to close.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use shared::{config::server::GenerationConfig, models::generation::GenerationRequest};

/// Finite, non-restartable sequence of generated text fragments.
pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send + 'static>>;

/// Failures of one generation exchange. All of them are recoverable at the
/// session level: the session reports them and returns to waiting.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("backend stream idle for more than {0}s")]
    IdleTimeout(u64),
    #[error("backend transport error: {0}")]
    Transport(String),
}

/// A source of lazily generated text fragments.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Starts one generation exchange and returns its fragment stream.
    ///
    /// # Errors
    /// Fails when the exchange cannot be started; failures mid-stream are
    /// reported through the stream itself.
    async fn stream(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError>;
}

#[derive(Serialize)]
struct ChatPayload {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Complete objects drained from the reassembly buffer in one pass.
#[derive(Debug, Default, PartialEq)]
struct Drained {
    fragments: Vec<String>,
    done: bool,
}

/// Pulls every complete object out of `buffer`, leaving partial or
/// unparseable data in place for the next read.
fn drain_buffer(buffer: &mut String) -> Drained {
    let mut drained = Drained::default();
    while let Some(pos) = buffer.find('\n') {
        let taken: String = buffer.drain(..=pos).collect();
        let line = taken.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChatChunk>(line) {
            Ok(chunk) => {
                if let Some(message) = chunk.message
                    && !message.content.is_empty()
                {
                    drained.fragments.push(message.content);
                }
                if chunk.done {
                    drained.done = true;
                    return drained;
                }
            }
            Err(_) => {
                // Object split across reads or malformed output: keep
                // buffering until more bytes arrive. Never fatal.
                buffer.insert_str(0, line);
                break;
            }
        }
    }
    drained
}

/// Reads the chunked body and forwards fragments until the done marker, an
/// error, the idle timeout, or the receiver going away.
async fn relay_chunks(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<String, GenerationError>>,
    idle_timeout: Duration,
) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let read = match timeout(idle_timeout, body.next()).await {
            Ok(read) => read,
            Err(_) => {
                let _ = tx
                    .send(Err(GenerationError::IdleTimeout(idle_timeout.as_secs())))
                    .await;
                return;
            }
        };

        match read {
            None => {
                // Body ended without an explicit done marker: flush a final
                // unterminated object, then treat as normal exhaustion.
                if let Ok(chunk) = serde_json::from_str::<ChatChunk>(buffer.trim())
                    && let Some(message) = chunk.message
                    && !message.content.is_empty()
                {
                    let _ = tx.send(Ok(message.content)).await;
                }
                return;
            }
            Some(Err(err)) => {
                let _ = tx
                    .send(Err(GenerationError::Transport(err.to_string())))
                    .await;
                return;
            }
            Some(Ok(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                let drained = drain_buffer(&mut buffer);
                for fragment in drained.fragments {
                    if tx.send(Ok(fragment)).await.is_err() {
                        debug!("fragment receiver dropped; abandoning stream");
                        return;
                    }
                }
                if drained.done {
                    return;
                }
            }
        }
    }
}

/// Client for an Ollama-compatible generation backend.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    config: GenerationConfig,
}

impl OllamaClient {
    #[must_use]
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Builds the wire payload, filling unset sampling knobs from config.
    fn payload(&self, request: &GenerationRequest) -> ChatPayload {
        ChatPayload {
            model: self.config.model.clone(),
            messages: vec![WireMessage {
                role: "user",
                content: request.prompt.clone(),
            }],
            stream: true,
            system: request.system_prompt.clone(),
            options: SamplingOptions {
                temperature: request.temperature.unwrap_or(self.config.temperature),
                top_p: request.top_p.unwrap_or(self.config.top_p),
                num_predict: request.max_tokens.unwrap_or(self.config.max_tokens),
            },
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    #[instrument(name = "generation.stream", skip(self, request), err)]
    async fn stream(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let payload = self.payload(&request);

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| GenerationError::Request(err.to_string()))?;

        metrics::counter!("solace_generation_requests_total").increment(1);

        if !response.status().is_success() {
            return Err(GenerationError::Status(response.status().as_u16()));
        }

        let (tx, rx) = mpsc::channel(32);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        tokio::spawn(relay_chunks(response, tx, idle_timeout));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
