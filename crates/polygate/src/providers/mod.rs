//! Provider adapters.
//!
//! Each adapter owns one provider family's request marshalling, message
//! normalization, streaming decode and error classification. All adapters
//! converge on the OpenAI chunk shape; provider idioms (`reasoning` fields,
//! thinking blocks, Gemini `thought` parts) are translated here and nowhere
//! else.

use crate::chat::{
    AudioPayload, ChatCompletionRequest, ChatCompletionResponse, ChunkStream, EmbeddingRequest,
    EmbeddingResponse, SpeechRequest, TranscriptionResponse,
};
use crate::config::ModelProfile;
use crate::error::GatewayError;
use crate::providers::media::MediaUploader;
use crate::rotation::RotationIndex;
use crate::session::SessionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub mod google;
pub mod media;
pub mod normalize;
pub mod openai;
pub mod policy;

/// Shared plumbing injected into every adapter: the process-wide HTTP client
/// (adapters must not close it), rotation state, the session KV (signature
/// stash, cached-content names) and the media uploader.
#[derive(Clone)]
pub struct AdapterContext {
    pub http: reqwest::Client,
    pub rotation: Arc<RotationIndex>,
    pub sessions: Arc<SessionStore>,
    pub media: Arc<MediaUploader>,
    /// Scripted stream instead of a provider call, for load tests.
    pub mock_mode: bool,
    /// Minimum prefix size (chars) before the Gemini context cache engages.
    pub gemini_cache_min_chars: usize,
    pub reasoning_models: HashMap<String, crate::config::ReasoningModelConfig>,
}

/// One provider family's marshalling surface. `embed`, `speech` and
/// `transcribe` are optional capabilities.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn chat_unary(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChatCompletionResponse, GatewayError>;

    async fn chat_stream(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChunkStream, GatewayError>;

    async fn embed(
        &self,
        _req: &EmbeddingRequest,
        _profile: &ModelProfile,
        _key: &str,
    ) -> Result<EmbeddingResponse, GatewayError> {
        Err(GatewayError::BadRequest(
            "embeddings not supported by this provider".into(),
        ))
    }

    async fn speech(
        &self,
        _req: &SpeechRequest,
        _profile: &ModelProfile,
        _key: &str,
    ) -> Result<AudioPayload, GatewayError> {
        Err(GatewayError::BadRequest(
            "speech synthesis not supported by this provider".into(),
        ))
    }

    async fn transcribe(
        &self,
        _file_name: &str,
        _bytes: Vec<u8>,
        _profile: &ModelProfile,
        _key: &str,
    ) -> Result<TranscriptionResponse, GatewayError> {
        Err(GatewayError::BadRequest(
            "transcription not supported by this provider".into(),
        ))
    }
}

/// Maps provider names onto adapters. Unregistered providers fall back to
/// the OpenAI-compatible adapter, which is what the gateway surface promises
/// anyway.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    fallback: Arc<dyn ProviderAdapter>,
}

impl AdapterRegistry {
    /// The standard wiring: Gemini wire for `google*`, OpenAI-compatible for
    /// everything else.
    pub fn standard(ctx: AdapterContext) -> Arc<Self> {
        let openai: Arc<dyn ProviderAdapter> = Arc::new(openai::OpenAiCompatAdapter::new(ctx.clone()));
        let gemini: Arc<dyn ProviderAdapter> = Arc::new(google::GeminiAdapter::new(ctx));

        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("google".to_string(), Arc::clone(&gemini));
        adapters.insert("google-tts".to_string(), gemini);
        Arc::new(AdapterRegistry {
            adapters,
            fallback: openai,
        })
    }

    pub fn with_fallback(
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        fallback: Arc<dyn ProviderAdapter>,
    ) -> Arc<Self> {
        Arc::new(AdapterRegistry { adapters, fallback })
    }

    pub fn for_provider(&self, provider: &str) -> Arc<dyn ProviderAdapter> {
        self.adapters
            .get(provider)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Reads a non-success response's body and maps it onto the gateway error
/// model (400 → `BadRequest`, everything else keeps its status).
pub async fn error_from_response(resp: reqwest::Response) -> GatewayError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = extract_error_message(&body);
    GatewayError::from_status(status, message)
}

/// Pulls the human-readable message out of a provider error body, falling
/// back to the raw text.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            // Keep the raw body too: agent recovery mines it for
            // failed_generation payloads.
            return format!("{} | Details: {}", message, body);
        }
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    if body.is_empty() {
        "unknown error".to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_extraction_prefers_nested_message() {
        let body = r#"{"error":{"message":"tool_use_failed","failed_generation":"<ACTION>x</ACTION>"}}"#;
        let message = extract_error_message(body);
        assert!(message.starts_with("tool_use_failed"));
        assert!(message.contains("failed_generation"));

        assert_eq!(extract_error_message(r#"{"detail":"nope"}"#), "nope");
        assert_eq!(extract_error_message("plain"), "plain");
        assert_eq!(extract_error_message(""), "unknown error");
    }
}
