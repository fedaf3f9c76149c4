pub mod media;
pub mod openrouter;

use std::sync::Arc;

use async_trait::async_trait;

use crate::flow::catalog::AspectFormat;

pub use openrouter::OpenRouterImageClient;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Provider model id, e.g. `google/gemini-2.5-flash-image`.
    pub model: String,
    pub format: AspectFormat,
    pub source_image: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned status {status}: {detail}")]
    Provider { status: u16, detail: String },
    #[error("no image found in provider response: {0}")]
    Parse(String),
    #[error("image payload could not be decoded: {0}")]
    Decode(String),
}

impl GenerationFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationFailure::Transport(_) => "transport",
            GenerationFailure::Provider { .. } => "provider",
            GenerationFailure::Parse(_) => "parse",
            GenerationFailure::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Success { image_bytes: Vec<u8> },
    Failure { reason: GenerationFailure },
}

impl From<Result<Vec<u8>, GenerationFailure>> for GenerationResult {
    fn from(result: Result<Vec<u8>, GenerationFailure>) -> Self {
        match result {
            Ok(image_bytes) if image_bytes.is_empty() => GenerationResult::Failure {
                reason: GenerationFailure::Decode("decoded image is empty".to_string()),
            },
            Ok(image_bytes) => GenerationResult::Success { image_bytes },
            Err(reason) => GenerationResult::Failure { reason },
        }
    }
}

/// One request/response cycle against an image provider. Implementations never return
/// errors out of band: every failure is a `GenerationResult::Failure`.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult;
}
