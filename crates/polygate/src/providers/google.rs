//! Gemini-style provider adapter.
//!
//! Translates between the OpenAI-shaped gateway surface and the Gemini
//! `contents`/`parts` wire. Three provider idioms live entirely in here:
//!
//! - *Thought parts* (`thought: true`) become `reasoning_content` deltas.
//! - *Thought signatures* ride back to the client as an HTML comment in the
//!   last textual chunk, and are stashed in the session KV keyed by
//!   tool-call id so the next turn can reattach them to the reconstructed
//!   `functionCall` part.
//! - *Context caching*: when the conversation prefix (everything but the
//!   final turn) is large enough, it is upserted as a named cached-content
//!   object by content hash and later requests send only the last turn plus
//!   a `cachedContent` reference. The size gate is a character-count proxy
//!   for the provider's token rule; see the config threshold.

use crate::chat::{
    AudioPayload, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, Choice, ChunkStream, MessageContent, SpeechRequest, ToolCallDelta, Usage,
    AssistantMessage, now_unix_seconds,
};
use crate::config::ModelProfile;
use crate::error::GatewayError;
use crate::providers::{error_from_response, normalize, AdapterContext, ProviderAdapter};
use crate::ToolCall;
use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine as _;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const GENERATE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

const UNARY_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a stashed thought signature survives; the caller is expected to
/// send the tool result back within the hour.
const SIGNATURE_TTL: Duration = Duration::from_secs(3600);
/// Slightly under the provider-side cached-content TTL so we never reference
/// an expired name.
const CACHE_NAME_TTL: Duration = Duration::from_secs(3500);

fn signature_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n?<!-- thought_signature: (.*?) -->").expect("valid regex"))
}

fn data_uri_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"data:image/[^;]+;base64,[^"\)\s>]+"#).expect("valid regex")
    })
}

fn signature_kv_key(tool_call_id: &str) -> String {
    format!("signature:{}", tool_call_id)
}

/// Renders the signature comment appended to the final textual chunk.
fn signature_comment(signature: &str) -> String {
    format!("\n<!-- thought_signature: {} -->", signature)
}

pub struct GeminiAdapter {
    ctx: AdapterContext,
}

impl GeminiAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        GeminiAdapter { ctx }
    }

    /// Splits a text payload into Gemini parts: inline images become
    /// `inlineData`, and a trailing signature comment is lifted onto the
    /// text part as `thought_signature`.
    fn text_to_parts(text: &str) -> Vec<Value> {
        let mut parts = Vec::new();
        let mut cursor = 0usize;
        for m in data_uri_pattern().find_iter(text) {
            let prefix = &text[cursor..m.start()];
            Self::push_text_part(&mut parts, prefix);
            match crate::providers::media::split_data_uri(m.as_str()) {
                Ok((mime, data)) => {
                    parts.push(json!({"inlineData": {"mimeType": mime, "data": data}}));
                }
                Err(e) => {
                    error!(error = %e, "failed to process embedded image");
                    parts.push(json!({"text": "[Image processing failed]"}));
                }
            }
            cursor = m.end();
        }
        Self::push_text_part(&mut parts, &text[cursor..]);
        parts
    }

    fn push_text_part(parts: &mut Vec<Value>, text: &str) {
        let signature = signature_pattern()
            .captures(text)
            .map(|c| c[1].to_string());
        let clean = signature_pattern().replace_all(text, "").trim().to_string();
        if clean.is_empty() {
            return;
        }
        let mut part = json!({"text": clean});
        if let Some(signature) = signature {
            part["thought_signature"] = Value::String(signature);
        }
        parts.push(part);
    }

    fn content_to_parts(content: &MessageContent) -> Vec<Value> {
        match content {
            MessageContent::Text(text) => Self::text_to_parts(text),
            MessageContent::Parts(items) => {
                let mut parts = Vec::new();
                for item in items {
                    match item.kind.as_str() {
                        "text" => {
                            parts.extend(Self::text_to_parts(item.text.as_deref().unwrap_or("")));
                        }
                        "image_url" => {
                            let url = item
                                .image_url
                                .as_ref()
                                .map(|i| i.url.as_str())
                                .unwrap_or("");
                            if url.starts_with("data:") {
                                match crate::providers::media::split_data_uri(url) {
                                    Ok((mime, data)) => parts.push(
                                        json!({"inlineData": {"mimeType": mime, "data": data}}),
                                    ),
                                    Err(e) => {
                                        error!(error = %e, "failed to process image part");
                                        parts.push(json!({"text": "[Image processing failed]"}));
                                    }
                                }
                            } else {
                                warn!("gemini wire only accepts inline data images");
                                parts.push(json!({"text": format!("[Image URL: {}]", url)}));
                            }
                        }
                        _ => {}
                    }
                }
                parts
            }
        }
    }

    /// Builds the `contents` list, reattaching stashed signatures to
    /// reconstructed `functionCall` parts.
    async fn build_contents(&self, messages: &[ChatMessage]) -> Vec<Value> {
        let mut contents = Vec::new();
        for msg in messages {
            if msg.role == "tool" {
                let name = msg.name.as_deref().unwrap_or("unknown_tool");
                let raw = msg
                    .content
                    .as_ref()
                    .map(|c| c.as_text())
                    .unwrap_or_default();
                let response = serde_json::from_str::<Value>(&raw)
                    .unwrap_or_else(|_| json!({"content": raw}));
                contents.push(json!({
                    "role": "function",
                    "parts": [{"functionResponse": {"name": name, "response": response}}]
                }));
                continue;
            }

            if msg.role == "assistant" {
                if let Some(tool_calls) = &msg.tool_calls {
                    let mut parts = Vec::new();
                    if let Some(content) = &msg.content {
                        parts.extend(Self::content_to_parts(content));
                    }
                    for call in tool_calls {
                        let args = serde_json::from_str::<Value>(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        let mut part = json!({
                            "functionCall": {"name": call.function.name, "args": args}
                        });
                        if let Some(signature) =
                            self.ctx.sessions.kv_get(&signature_kv_key(&call.id)).await
                        {
                            part["thought_signature"] = Value::String(signature);
                        }
                        parts.push(part);
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                    continue;
                }
                if msg.content.is_none() {
                    continue;
                }
            }

            let role = if msg.role == "assistant" { "model" } else { "user" };
            let Some(content) = &msg.content else { continue };
            let parts = Self::content_to_parts(content);
            if parts.is_empty() {
                continue;
            }
            contents.push(json!({"role": role, "parts": parts}));
        }
        contents
    }

    /// Upserts a cached-content object for the conversation prefix and
    /// returns its resource name, or `None` when the prefix is below the
    /// admission threshold.
    async fn get_or_create_cache(
        &self,
        contents: &[Value],
        real_model: &str,
        key: &str,
    ) -> Option<String> {
        if contents.len() < 2 {
            return None;
        }
        let prefix = &contents[..contents.len() - 1];

        let mut total_chars = 0usize;
        let mut hasher = Sha256::new();
        for msg in prefix {
            hasher.update(msg.get("role").and_then(Value::as_str).unwrap_or("").as_bytes());
            for part in msg.get("parts").and_then(Value::as_array).into_iter().flatten() {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    total_chars += text.len();
                    hasher.update(text.as_bytes());
                }
                if let Some(inline) = part.get("inlineData") {
                    let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
                    total_chars += data.len();
                    hasher.update(inline.get("mimeType").and_then(Value::as_str).unwrap_or("").as_bytes());
                    hasher.update(data.as_bytes());
                }
                for field in ["functionCall", "functionResponse"] {
                    if let Some(value) = part.get(field) {
                        hasher.update(value.to_string().as_bytes());
                    }
                }
            }
        }
        if total_chars < self.ctx.gemini_cache_min_chars {
            return None;
        }

        let content_hash = hex::encode(hasher.finalize());
        let key_suffix = if key.len() >= 6 { &key[key.len() - 6..] } else { key };
        let kv_key = format!("gemini_cache:{}:{}:{}", key_suffix, real_model, content_hash);

        if let Some(name) = self.ctx.sessions.kv_get(&kv_key).await {
            info!(cache = %name, "context cache hit");
            return Some(name);
        }

        info!(chars = total_chars, "creating context cache for conversation prefix");
        let payload = json!({
            "model": format!("models/{}", real_model),
            "ttl": "3600s",
            "contents": prefix,
        });
        let result = self
            .ctx
            .http
            .post(format!("{}/cachedContents", GENERATE_BASE))
            .header("x-goog-api-key", key)
            .timeout(Duration::from_secs(20))
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(resp) => {
                let name = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string));
                if let Some(name) = name {
                    self.ctx
                        .sessions
                        .kv_set(&kv_key, &name, CACHE_NAME_TTL)
                        .await;
                    info!(cache = %name, "context cache created");
                    return Some(name);
                }
                None
            }
            Err(e) => {
                error!(error = %e, "context cache creation failed");
                None
            }
        }
    }

    /// Assembles the request body shared by the unary and streaming paths.
    async fn build_payload(
        &self,
        req: &ChatCompletionRequest,
        real_model: &str,
        key: &str,
    ) -> Result<Value, GatewayError> {
        let messages = normalize::normalize_for_gemini(req.messages.clone());
        let contents = self.build_contents(&messages).await;
        let cached_name = self.get_or_create_cache(&contents, real_model, key).await;

        let final_contents = match &cached_name {
            Some(_) if !contents.is_empty() => vec![contents[contents.len() - 1].clone()],
            _ => contents,
        };

        let mut payload = json!({"contents": final_contents});
        if let Some(name) = cached_name {
            payload["cachedContent"] = Value::String(name);
        }

        if let Some(tools) = &req.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| serde_json::to_value(&t.function))
                .collect::<Result<_, _>>()?;
            payload["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let mut generation = serde_json::Map::new();
        if let Some(t) = req.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = req.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(m) = req.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(m));
        }
        if req
            .response_format
            .as_ref()
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
            == Some("json_object")
        {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(cfg) = self
            .ctx
            .reasoning_models
            .get(real_model)
            .filter(|cfg| cfg.provider == "google")
        {
            if let Some(budget) = cfg.params.get("thinking_budget").and_then(Value::as_i64) {
                if budget != 0 {
                    generation.insert(
                        "thinkingConfig".into(),
                        json!({"includeThoughts": true, "thinkingBudgetTokenLimit": budget}),
                    );
                }
            }
        }
        if !generation.is_empty() {
            payload["generationConfig"] = Value::Object(generation);
        }
        Ok(payload)
    }

    async fn stash_signature(&self, tool_call_id: &str, signature: &str) {
        self.ctx
            .sessions
            .kv_set(&signature_kv_key(tool_call_id), signature, SIGNATURE_TTL)
            .await;
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn chat_unary(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let real_model = self
            .ctx
            .rotation
            .next_model("google", &profile.model_params.model);
        let payload = self.build_payload(req, &real_model, key).await?;
        let url = format!("{}/models/{}:generateContent", GENERATE_BASE, real_model);

        let resp = self
            .ctx
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .timeout(UNARY_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body: Value = resp.json().await?;

        let usage = body.get("usageMetadata").cloned().unwrap_or(json!({}));
        let mut content = String::new();
        let mut thoughts = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut last_signature: Option<String> = None;
        let mut finish_reason = "stop".to_string();

        match body.get("candidates").and_then(Value::as_array).and_then(|c| c.first()) {
            None => {
                let reason = body
                    .pointer("/promptFeedback/blockReason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                content = format!("[Blocked: {}]", reason);
            }
            Some(candidate) => {
                finish_reason = match candidate.get("finishReason").and_then(Value::as_str) {
                    Some("MAX_TOKENS") => "length",
                    Some("SAFETY") => "content_filter",
                    Some("TOOL_CALLS") => "tool_calls",
                    _ => "stop",
                }
                .to_string();

                let parts = candidate
                    .pointer("/content/parts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for part in parts {
                    if let Some(sig) = part.get("thought_signature").and_then(Value::as_str) {
                        last_signature = Some(sig.to_string());
                    }
                    if let Some(fc) = part.get("functionCall") {
                        let call_id = format!("call_{}", Uuid::new_v4().simple());
                        tool_calls.push(ToolCall::function(
                            &call_id,
                            fc.get("name").and_then(Value::as_str).unwrap_or(""),
                            serde_json::to_string(fc.get("args").unwrap_or(&json!({})))?,
                        ));
                        if let Some(sig) = &last_signature {
                            self.stash_signature(&call_id, sig).await;
                        }
                    }
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                            thoughts.push_str(text);
                        } else {
                            content.push_str(text);
                        }
                    }
                }
            }
        }

        let mut message_content = content;
        if !thoughts.is_empty() {
            message_content = format!("<think>\n{}\n</think>\n\n{}", thoughts, message_content);
        }
        if let Some(sig) = &last_signature {
            message_content.push_str(&signature_comment(sig));
        }

        Ok(ChatCompletionResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: now_unix_seconds(),
            model: req.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some(message_content),
                    reasoning_content: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: Some(finish_reason),
            }],
            usage: Some(Usage {
                prompt_tokens: usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0)
                    as u32,
                completion_tokens: usage
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                total_tokens: usage.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(0)
                    as u32,
            }),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        key: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let real_model = self
            .ctx
            .rotation
            .next_model("google", &profile.model_params.model);
        let payload = self.build_payload(req, &real_model, key).await?;
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            GENERATE_BASE, real_model
        );
        debug!(model = %real_model, "starting gemini stream");

        let resp = self
            .ctx
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .timeout(STREAM_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let chunk_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let created = now_unix_seconds();
        let model = req.model.clone();
        let sessions = self.ctx.sessions.clone();
        let mut events = resp.bytes_stream().eventsource();

        let stream = try_stream! {
            let mut role_sent = false;
            let mut last_signature: Option<String> = None;

            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|e| GatewayError::Http(format!("stream transport error: {}", e)))?;
                let Ok(body) = serde_json::from_str::<Value>(&event.data) else {
                    continue;
                };
                let Some(candidate) = body
                    .get("candidates")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                else {
                    continue;
                };

                if !role_sent {
                    yield ChatCompletionChunk::role(&chunk_id, created, &model);
                    role_sent = true;
                }

                let parts = candidate
                    .pointer("/content/parts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for part in parts {
                    if let Some(sig) = part.get("thought_signature").and_then(Value::as_str) {
                        last_signature = Some(sig.to_string());
                    }
                    if let Some(fc) = part.get("functionCall") {
                        let call_id = format!("call_{}", Uuid::new_v4().simple());
                        if let Some(sig) = &last_signature {
                            sessions
                                .kv_set(&signature_kv_key(&call_id), sig, SIGNATURE_TTL)
                                .await;
                        }
                        let call = ToolCall::function(
                            &call_id,
                            fc.get("name").and_then(Value::as_str).unwrap_or(""),
                            serde_json::to_string(fc.get("args").unwrap_or(&json!({})))?,
                        );
                        yield ChatCompletionChunk::tool_calls(
                            &chunk_id,
                            created,
                            &model,
                            vec![ToolCallDelta::complete(0, call)],
                        );
                        continue;
                    }
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                            yield ChatCompletionChunk::reasoning(&chunk_id, created, &model, text);
                        } else {
                            yield ChatCompletionChunk::content(&chunk_id, created, &model, text);
                        }
                    }
                }
            }

            if let Some(sig) = &last_signature {
                yield ChatCompletionChunk::content(
                    &chunk_id,
                    created,
                    &model,
                    signature_comment(sig),
                );
            }
            yield ChatCompletionChunk::finish(&chunk_id, created, &model, "stop");
        };
        Ok(Box::pin(stream))
    }

    async fn speech(
        &self,
        req: &SpeechRequest,
        _profile: &ModelProfile,
        key: &str,
    ) -> Result<AudioPayload, GatewayError> {
        let voice = req.voice.as_deref().unwrap_or("en-US-Wavenet-D");
        let format = req.response_format.as_deref().unwrap_or("mp3").to_lowercase();
        let speed = req.speed.unwrap_or(1.0);
        let lang_code = voice
            .split('-')
            .take(2)
            .collect::<Vec<_>>()
            .join("-");

        let encoding = match format.as_str() {
            "opus" => "OGG_OPUS",
            "flac" => "FLAC",
            _ => "MP3",
        };
        let payload = json!({
            "input": {"text": req.input},
            "voice": {"languageCode": lang_code, "name": voice},
            "audioConfig": {"audioEncoding": encoding, "speakingRate": speed},
        });

        let resp = self
            .ctx
            .http
            .post(TTS_URL)
            .header("x-goog-api-key", key)
            .timeout(Duration::from_secs(120))
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body: Value = resp.json().await?;
        let audio = body
            .get("audioContent")
            .and_then(Value::as_str)
            .unwrap_or("");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(audio)
            .map_err(|e| GatewayError::ParseError(format!("invalid audio payload: {}", e)))?;

        let media_type = match format.as_str() {
            "mp3" | "aac" => "audio/mpeg".to_string(),
            other => format!("audio/{}", other),
        };
        Ok(AudioPayload { media_type, bytes })
    }
}
