use serde::{Deserialize, Serialize};

/// Ephemeral description of one generation exchange.
///
/// Sampling knobs left as `None` are filled in from configuration by the
/// backend client before the request goes on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    /// User-visible prompt text.
    pub prompt: String,
    /// Optional system context placed ahead of the prompt.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Request carrying only a prompt, with every knob left to defaults.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}
