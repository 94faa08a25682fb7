//! OpenAI-compatible provider adapter.
//!
//! Covers every provider speaking the `/chat/completions` dialect (groq,
//! cerebras, mistral, sambanova, self-hosted `local*` endpoints, and plain
//! OpenAI-shaped `api_base` overrides). The streaming path re-emits provider
//! chunks in the normalized shape, translating reasoning idioms and raising
//! in-stream error objects as `BadRequest` so the agent drivers can attempt
//! recovery.

use crate::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkStream,
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, TranscriptionResponse, now_unix_seconds,
};
use crate::config::ModelProfile;
use crate::error::GatewayError;
use crate::providers::policy::{compose_payload, resolve_policy, OutputHandling};
use crate::providers::{error_from_response, normalize, AdapterContext, ProviderAdapter};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const UNARY_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Parameters groq validates strictly and rejects.
const GROQ_FORBIDDEN_PARAMS: &[&str] = &[
    "n",
    "logprobs",
    "top_logprobs",
    "logit_bias",
    "presence_penalty",
    "frequency_penalty",
];

pub struct OpenAiCompatAdapter {
    ctx: AdapterContext,
}

impl OpenAiCompatAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        OpenAiCompatAdapter { ctx }
    }

    fn api_base(profile: &ModelProfile) -> String {
        match profile.provider.as_str() {
            "mistral" => "https://api.mistral.ai/v1".to_string(),
            "groq" => "https://api.groq.com/openai/v1".to_string(),
            "cerebras" => "https://api.cerebras.ai/v1".to_string(),
            "sambanova" => "https://api.sambanova.ai/v1".to_string(),
            _ => profile
                .model_params
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    fn strip_provider_params(payload: &mut Map<String, Value>, provider: &str) {
        if provider == "groq" {
            for param in GROQ_FORBIDDEN_PARAMS {
                payload.remove(*param);
            }
        }
    }

    async fn build_payload(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        stream: bool,
    ) -> Result<(Map<String, Value>, String, Option<OutputHandling>), GatewayError> {
        let provider = profile.provider.as_str();
        let real_model = self
            .ctx
            .rotation
            .next_model(provider, &profile.model_params.model);

        let policy = resolve_policy(profile, &real_model, req.tools.as_deref());
        let reasoning = self.ctx.reasoning_models.get(&real_model);
        let (mut payload, output_handling) =
            compose_payload(req, &policy, &real_model, provider, reasoning);

        let mut messages = req.messages.clone();
        if !provider.starts_with("local") {
            self.ctx.media.externalize_messages(&mut messages).await;
        }
        let messages = normalize::normalize_for_openai(messages);
        payload.insert("messages".to_string(), serde_json::to_value(&messages)?);
        payload.insert("stream".to_string(), Value::Bool(stream));

        Self::strip_provider_params(&mut payload, provider);
        if provider == "mistral" && profile.model_params.safe_mode {
            payload.insert("safe_prompt".to_string(), Value::Bool(true));
        }

        Ok((payload, real_model, output_handling))
    }

    fn request(
        &self,
        profile: &ModelProfile,
        path: &str,
        key: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", Self::api_base(profile).trim_end_matches('/'), path);
        let builder = self.ctx.http.post(url).timeout(timeout);
        if profile.provider.starts_with("local") {
            builder
        } else {
            builder.bearer_auth(key)
        }
    }

    fn mock_stream(&self, profile: &ModelProfile) -> ChunkStream {
        let chunk_id = format!("mock-{}", Uuid::new_v4().simple());
        let created = now_unix_seconds();
        let model = profile.model_params.model.clone();
        let stream = try_stream! {
            yield ChatCompletionChunk::role(&chunk_id, created, &model);
            for token in ["This", " is", " a", " scripted", " response."] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                yield ChatCompletionChunk::content(&chunk_id, created, &model, token);
            }
            yield ChatCompletionChunk::finish(&chunk_id, created, &model, "stop");
        };
        Box::pin(stream)
    }
}

/// Rewrites one provider chunk into the normalized delta shape.
///
/// Returns `Err` for in-stream error objects (400-class recovery material)
/// and `Ok(None)` for chunks that should be skipped.
fn translate_chunk(
    mut value: Value,
    output_handling: Option<OutputHandling>,
) -> Result<Option<Value>, GatewayError> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown stream error");
        let details = serde_json::to_string(error).unwrap_or_default();
        return Err(GatewayError::BadRequest(format!(
            "provider stream error: {} | Details: {}",
            message, details
        )));
    }

    let Some(delta) = value
        .get_mut("choices")
        .and_then(Value::as_array_mut)
        .and_then(|choices| choices.first_mut())
        .and_then(|choice| choice.get_mut("delta"))
        .and_then(Value::as_object_mut)
    else {
        return Ok(None);
    };

    // Cerebras-style reasoning arrives in a `reasoning` field.
    if output_handling == Some(OutputHandling::DeltaReasoningField) {
        if let Some(reasoning) = delta.remove("reasoning") {
            if !reasoning.is_null() {
                delta.insert("reasoning_content".to_string(), reasoning);
            }
        }
    }

    // Mistral structured content: a list mixing text and thinking blocks.
    if let Some(Value::Array(blocks)) = delta.get("content").cloned() {
        let mut text = String::new();
        let mut reasoning = String::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
                }
                Some("thinking") => match block.get("thinking") {
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            if part.get("type").and_then(Value::as_str) == Some("text") {
                                reasoning
                                    .push_str(part.get("text").and_then(Value::as_str).unwrap_or(""));
                            }
                        }
                    }
                    Some(Value::String(s)) => reasoning.push_str(s),
                    _ => {}
                },
                _ => {}
            }
        }
        if text.is_empty() {
            delta.remove("content");
        } else {
            delta.insert("content".to_string(), Value::String(text));
        }
        if !reasoning.is_empty() {
            delta.insert("reasoning_content".to_string(), Value::String(reasoning));
        }
    }

    Ok(Some(value))
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn chat_unary(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let (payload, real_model, _) = self.build_payload(req, profile, false).await?;
        debug!(provider = %profile.provider, model = %real_model, "unary chat request");

        let resp = self
            .request(profile, "chat/completions", key, UNARY_TIMEOUT)
            .json(&Value::Object(payload))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let mut body: Value = resp.json().await?;
        if body.get("usage").is_none() {
            body["usage"] = serde_json::json!({
                "prompt_tokens": 0,
                "completion_tokens": 0,
                "total_tokens": 0
            });
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn chat_stream(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChunkStream, GatewayError> {
        if self.ctx.mock_mode {
            return Ok(self.mock_stream(profile));
        }

        let (payload, real_model, output_handling) = self.build_payload(req, profile, true).await?;
        info!(provider = %profile.provider, model = %real_model, "starting provider stream");

        let resp = self
            .request(profile, "chat/completions", key, STREAM_TIMEOUT)
            .json(&Value::Object(payload))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let provider = profile.provider.clone();
        let mut events = resp.bytes_stream().eventsource();
        let stream = try_stream! {
            let mut role_seen = false;
            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|e| GatewayError::Http(format!("stream transport error: {}", e)))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(value) => value,
                    Err(e) => {
                        // Error payloads that fail normal decoding still
                        // carry recovery material.
                        if event.data.contains("\"error\":")
                            && event.data.contains("\"failed_generation\":")
                        {
                            Err::<(), GatewayError>(GatewayError::BadRequest(format!(
                                "provider stream error (raw): {}",
                                event.data
                            )))?;
                        }
                        warn!(provider = %provider, error = %e, "skipping undecodable chunk");
                        continue;
                    }
                };
                let Some(translated) = translate_chunk(value, output_handling)? else {
                    continue;
                };
                let mut chunk: ChatCompletionChunk = match serde_json::from_value(translated) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "skipping malformed chunk");
                        continue;
                    }
                };
                if !role_seen {
                    if let Some(choice) = chunk.choices.first_mut() {
                        if choice.delta.role.is_none() {
                            choice.delta.role = Some("assistant".to_string());
                        }
                    }
                    role_seen = true;
                }
                yield chunk;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(
        &self,
        req: &EmbeddingRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let real_model = self
            .ctx
            .rotation
            .next_model(&profile.provider, &profile.model_params.model);
        let payload = serde_json::json!({
            "model": real_model,
            "input": req.input.clone().into_vec(),
            "encoding_format": req.encoding_format,
            "dimensions": req.dimensions,
        });

        let resp = self
            .request(profile, "embeddings", key, UNARY_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        #[derive(serde::Deserialize)]
        struct RawEmbedding {
            embedding: Vec<f32>,
        }
        #[derive(serde::Deserialize)]
        struct RawResponse {
            data: Vec<RawEmbedding>,
        }
        let raw: RawResponse = resp.json().await?;
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            model: real_model,
            data: raw
                .data
                .into_iter()
                .enumerate()
                .map(|(index, d)| EmbeddingData {
                    object: "embedding".to_string(),
                    embedding: d.embedding,
                    index,
                })
                .collect(),
            usage: None,
        })
    }

    async fn transcribe(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<TranscriptionResponse, GatewayError> {
        let real_model = self
            .ctx
            .rotation
            .next_model(&profile.provider, &profile.model_params.model);
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", real_model)
            .part("file", part);

        let resp = self
            .request(profile, "audio/transcriptions", key, UNARY_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;

    fn profile(provider: &str) -> ModelProfile {
        ModelProfile {
            model_name: "p".into(),
            provider: provider.into(),
            model_params: ModelParams {
                model: "m".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn base_urls_per_provider() {
        assert_eq!(
            OpenAiCompatAdapter::api_base(&profile("groq")),
            "https://api.groq.com/openai/v1"
        );
        assert_eq!(
            OpenAiCompatAdapter::api_base(&profile("mistral")),
            "https://api.mistral.ai/v1"
        );
        let mut custom = profile("myprovider");
        custom.model_params.api_base = Some("https://llm.internal/v1".into());
        assert_eq!(
            OpenAiCompatAdapter::api_base(&custom),
            "https://llm.internal/v1"
        );
    }

    #[test]
    fn groq_forbidden_params_are_stripped() {
        let mut payload = Map::new();
        payload.insert("n".into(), serde_json::json!(2));
        payload.insert("logit_bias".into(), serde_json::json!({}));
        payload.insert("temperature".into(), serde_json::json!(0.7));
        OpenAiCompatAdapter::strip_provider_params(&mut payload, "groq");
        assert!(!payload.contains_key("n"));
        assert!(!payload.contains_key("logit_bias"));
        assert!(payload.contains_key("temperature"));
    }

    #[test]
    fn translate_maps_reasoning_field() {
        let chunk = serde_json::json!({
            "id": "c1", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"reasoning": "thinking..."}}]
        });
        let out = translate_chunk(chunk, Some(OutputHandling::DeltaReasoningField))
            .unwrap()
            .unwrap();
        let delta = &out["choices"][0]["delta"];
        assert_eq!(delta["reasoning_content"], "thinking...");
        assert!(delta.get("reasoning").is_none());
    }

    #[test]
    fn translate_flattens_thinking_blocks() {
        let chunk = serde_json::json!({
            "id": "c1", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": [
                {"type": "thinking", "thinking": [{"type": "text", "text": "hmm"}]},
                {"type": "text", "text": "answer"}
            ]}}]
        });
        let out = translate_chunk(chunk, None).unwrap().unwrap();
        let delta = &out["choices"][0]["delta"];
        assert_eq!(delta["content"], "answer");
        assert_eq!(delta["reasoning_content"], "hmm");
    }

    #[test]
    fn translate_raises_stream_errors_as_bad_request() {
        let chunk = serde_json::json!({
            "error": {"message": "tool_use_failed", "failed_generation": "<ACTION>{}</ACTION>"}
        });
        let err = translate_chunk(chunk, None).unwrap_err();
        match err {
            GatewayError::BadRequest(msg) => {
                assert!(msg.contains("tool_use_failed"));
                assert!(msg.contains("failed_generation"));
            }
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn translate_skips_choiceless_chunks() {
        let chunk = serde_json::json!({"id": "c1", "usage": {"prompt_tokens": 1}});
        assert!(translate_chunk(chunk, None).unwrap().is_none());
    }
}
