//! Text-generation collaborator.
//!
//! Tools that need a language model depend only on [`TextGenerator`]; the
//! HTTP client behind it lives outside this crate. [`GenerateTool`] exposes
//! any generator as a workflow tool.

use crate::workflow::tools::{Tool, ToolError};
use async_trait::async_trait;
use std::sync::Arc;
use toolflow_core::{Parameters, Value};

const DEFAULT_MAX_TOKENS: u32 = 256;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Error types for generation requests.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The generation service could not be reached
    #[error("Generation service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The requested model is not installed
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The service answered with something unusable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generates a completion for `prompt`.
    ///
    /// # Arguments
    ///
    /// * `prompt` - Input text
    /// * `max_tokens` - Upper bound on generated tokens
    /// * `temperature` - Sampling temperature
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

/// Exposes a [`TextGenerator`] as a tool.
///
/// Parameters:
/// - `prompt` (string, required)
/// - `max_tokens` (number, optional, default 256)
/// - `temperature` (number, optional, default 0.7)
///
/// The output is the generated text as a string value.
pub struct GenerateTool {
    name: String,
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
    temperature: f32,
}

impl GenerateTool {
    pub fn new(name: impl Into<String>, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            name: name.into(),
            generator,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Sets the defaults used when a step omits `max_tokens`/`temperature`.
    pub fn with_defaults(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn max_tokens(&self, parameters: &Parameters) -> Result<u32, ToolError> {
        match parameters.get("max_tokens") {
            None => Ok(self.max_tokens),
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ToolError::invalid_parameters(
                        &self.name,
                        format!("max_tokens must be a positive integer, got {}", value),
                    )
                }),
        }
    }

    fn temperature(&self, parameters: &Parameters) -> Result<f32, ToolError> {
        match parameters.get("temperature") {
            None => Ok(self.temperature),
            Some(value) => value
                .as_f64()
                .filter(|t| t.is_finite() && *t >= 0.0)
                .map(|t| t as f32)
                .ok_or_else(|| {
                    ToolError::invalid_parameters(
                        &self.name,
                        format!("temperature must be a non-negative number, got {}", value),
                    )
                }),
        }
    }
}

#[async_trait]
impl Tool for GenerateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Generates text from a prompt"
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<Value, ToolError> {
        let prompt = parameters
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_parameters(&self.name, "missing string 'prompt'"))?;
        let max_tokens = self.max_tokens(parameters)?;
        let temperature = self.temperature(parameters)?;

        tracing::debug!(tool = %self.name, max_tokens, temperature, "Generating text");
        let text = self
            .generator
            .generate(prompt, max_tokens, temperature)
            .await?;
        Ok(Value::String(text))
    }
}
