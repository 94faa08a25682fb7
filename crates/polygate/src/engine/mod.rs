//! The dispatch engine.
//!
//! Ties the router, credential pools and adapters together with the retry
//! and fallback rules:
//!
//! - per profile, keys are tried up to `total_keys + 1` times, each outcome
//!   driving the key lifecycle (release / quarantine / retire);
//! - a 429 fail-fasts to the next profile instead of burning the pool;
//! - streaming requests are peeked one chunk deep before the stream reaches
//!   the HTTP layer, so a fast-failing provider is replaced silently;
//!   once the first chunk has been emitted, a failure terminates the
//!   stream, never falls back;
//! - a user-supplied provider key bypasses the pool: one attempt, no
//!   quarantine, failure falls through to the next profile.

use crate::cache::ResponseCache;
use crate::chat::{
    AudioPayload, ChatCompletionRequest, ChatCompletionResponse, ChunkStream, EmbeddingRequest,
    EmbeddingResponse, SpeechRequest, TranscriptionResponse,
};
use crate::config::{GatewayConfig, ModelProfile, SharedConfig};
use crate::error::GatewayError;
use crate::keys::{KeyLease, KeyManager, QUARANTINE_TTL};
use crate::providers::AdapterRegistry;
use crate::rotation::RotationIndex;
use crate::router;
use crate::session::SessionStore;
use crate::User;
use async_stream::try_stream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod driver;
pub mod fuzzy_xml;
pub mod native;
pub mod react;

/// Upper bound on agent driver iterations.
pub const MAX_AGENT_ITERATIONS: usize = 10;

/// Pause between key attempts against the same provider.
const ATTEMPT_BACKOFF: Duration = Duration::from_millis(200);

/// What a provider reply means for the key that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// 429: quarantine the key and fail-fast to the next profile.
    RateLimited,
    /// 401/403: the key is dead, retire it and try another.
    AuthFailure,
    /// 5xx: bench the key and try another.
    ServerError,
    /// 400: the key is fine, the request is not. Recoverable upstream.
    ClientFault,
    /// Transport or unexpected errors: release and try another key.
    Transient,
}

fn classify(err: &GatewayError) -> Disposition {
    match err {
        GatewayError::Status { status: 429, .. } => Disposition::RateLimited,
        GatewayError::Status {
            status: 401 | 403, ..
        } => Disposition::AuthFailure,
        GatewayError::Status { status, .. } if *status >= 500 => Disposition::ServerError,
        GatewayError::BadRequest(_) => Disposition::ClientFault,
        _ => Disposition::Transient,
    }
}

pub struct ExecutionEngine {
    pub config: SharedConfig,
    pub keys: Arc<KeyManager>,
    pub rotation: Arc<RotationIndex>,
    pub adapters: Arc<AdapterRegistry>,
    pub cache: ResponseCache,
    pub sessions: Arc<SessionStore>,
    pub http: reqwest::Client,
}

impl ExecutionEngine {
    fn user_key<'a>(user: Option<&'a User>, provider: &str) -> Option<&'a str> {
        user.and_then(|u| u.provider_keys.get(provider)).map(String::as_str)
    }

    /// Key-scoped retry loop shared by every unary operation. `op` is called
    /// once per checked-out key; its error drives the key lifecycle.
    async fn with_key_rotation<T, F>(
        &self,
        profile: &ModelProfile,
        user: Option<&User>,
        op: impl Fn(String) -> F,
    ) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let provider = profile.provider.as_str();

        if let Some(key) = Self::user_key(user, provider) {
            info!(provider = %provider, "using user-supplied key, pool bypassed");
            return match op(key.to_string()).await {
                Ok(value) => Ok(value),
                Err(e @ GatewayError::BadRequest(_)) => Err(e),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "user key failed, falling through");
                    Err(GatewayError::ProviderUnavailable(format!(
                        "user key failed for '{}': {}",
                        provider, e
                    )))
                }
            };
        }

        let max_attempts = self.keys.total_keys(provider) + 1;
        let mut last_error: Option<GatewayError> = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(ATTEMPT_BACKOFF).await;
            }
            let lease = match KeyLease::acquire(Arc::clone(&self.keys), provider).await {
                Ok(lease) => lease,
                Err(e @ GatewayError::KeyTimeout(_)) => {
                    warn!(provider = %provider, attempt, "all keys busy");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match op(lease.key().to_string()).await {
                Ok(value) => {
                    lease.release();
                    return Ok(value);
                }
                Err(e) => {
                    let reason = e.to_string();
                    match classify(&e) {
                        Disposition::RateLimited => {
                            lease.quarantine(&reason, QUARANTINE_TTL);
                            warn!(provider = %provider, "rate limited, fail-fast to next profile");
                            return Err(GatewayError::ProviderUnavailable(reason));
                        }
                        Disposition::AuthFailure => {
                            lease.retire(&reason);
                            last_error = Some(e);
                        }
                        Disposition::ServerError => {
                            lease.quarantine(&reason, QUARANTINE_TTL);
                            last_error = Some(e);
                        }
                        Disposition::ClientFault => {
                            lease.release();
                            return Err(e);
                        }
                        Disposition::Transient => {
                            lease.release();
                            last_error = Some(e);
                        }
                    }
                }
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "'{}' failed after {} attempts: {}",
            provider,
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no keys".into())
        )))
    }

    /// Non-streaming chat across the alias chain, with the response cache in
    /// front.
    pub async fn dispatch_unary(
        &self,
        req: &ChatCompletionRequest,
        user: Option<&User>,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        if req.messages.is_empty() {
            return Err(GatewayError::BadRequest("messages must not be empty".into()));
        }
        let config = self.config.for_user(user);
        let chain = router::resolve_chain(&config, &self.rotation, &req.model).await?;

        let head_profile = chain.first().and_then(|name| config.profile(name));
        if let Some(profile) = head_profile {
            if let Some(hit) = self.cache.read(req, profile, &config.cache_settings).await {
                return Ok(hit);
            }
        }

        let mut last_error: Option<GatewayError> = None;
        for name in &chain {
            let Some(profile) = config.profile(name) else {
                warn!(profile = %name, "model profile not found, skipping");
                continue;
            };
            let adapter = self.adapters.for_provider(&profile.provider);
            let result = self
                .with_key_rotation(profile, user, async |key| {
                    adapter.chat_unary(req, profile, &key).await
                })
                .await;
            match result {
                Ok(response) => {
                    if let Some(head) = head_profile {
                        self.cache
                            .write(req, head, &config.cache_settings, &response)
                            .await;
                    }
                    return Ok(response);
                }
                Err(e) if e.is_silenceable() => {
                    warn!(profile = %name, error = %e, "provider unavailable, switching");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "all providers for '{}' are unavailable: {}",
            req.model,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "empty chain".into())
        )))
    }

    /// Streaming chat across the alias chain with the first-chunk peek.
    pub async fn dispatch_stream(
        &self,
        req: &ChatCompletionRequest,
        user: Option<&User>,
    ) -> Result<ChunkStream, GatewayError> {
        if req.messages.is_empty() {
            return Err(GatewayError::BadRequest("messages must not be empty".into()));
        }
        let config = self.config.for_user(user);
        let chain = router::resolve_chain(&config, &self.rotation, &req.model).await?;
        self.dispatch_stream_on_chain(req, &chain, &config, user).await
    }

    /// Streaming dispatch over a pre-resolved chain. Agent drivers resolve
    /// the chain once per request and reuse it across iterations.
    pub async fn dispatch_stream_on_chain(
        &self,
        req: &ChatCompletionRequest,
        chain: &[String],
        config: &GatewayConfig,
        user: Option<&User>,
    ) -> Result<ChunkStream, GatewayError> {
        let mut last_error: Option<GatewayError> = None;
        for name in chain {
            let Some(profile) = config.profile(name) else {
                warn!(profile = %name, "model profile not found, skipping");
                continue;
            };

            let mut stream = self.profile_stream(req.clone(), profile.clone(), user);
            // The peek: pull the first element before handing the stream to
            // the HTTP layer. A silenceable failure here is invisible to the
            // client; it just advances the chain.
            match stream.next().await {
                None => return Ok(Box::pin(futures::stream::empty())),
                Some(Ok(first)) => {
                    let chained = futures::stream::iter([Ok(first)]).chain(stream);
                    return Ok(Box::pin(chained));
                }
                Some(Err(e)) if e.is_silenceable() => {
                    warn!(profile = %name, error = %e, "stream failed to start, falling back");
                    last_error = Some(e);
                }
                Some(Err(e @ GatewayError::BadRequest(_))) => return Err(e),
                Some(Err(e)) => {
                    warn!(profile = %name, error = %e, "stream startup failed, forcing fallback");
                    last_error = Some(GatewayError::ProviderUnavailable(e.to_string()));
                }
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "all providers for '{}' are unavailable: {}",
            req.model,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "empty chain".into())
        )))
    }

    /// One profile's key-rotating stream. Key lifecycle decisions happen
    /// inside the generator; a dropped stream releases its lease via RAII.
    fn profile_stream(
        &self,
        req: ChatCompletionRequest,
        profile: ModelProfile,
        user: Option<&User>,
    ) -> ChunkStream {
        let keys = Arc::clone(&self.keys);
        let adapters = Arc::clone(&self.adapters);
        let user_key = Self::user_key(user, &profile.provider).map(str::to_string);

        let stream = try_stream! {
            let adapter = adapters.for_provider(&profile.provider);
            let provider = profile.provider.clone();

            if let Some(key) = user_key {
                info!(provider = %provider, "streaming with user-supplied key");
                let opened = match adapter.chat_stream(&req, &profile, &key).await {
                    Ok(inner) => Some(inner),
                    Err(e @ GatewayError::BadRequest(_)) => {
                        Err::<(), GatewayError>(e)?;
                        None
                    }
                    Err(e) => {
                        Err::<(), GatewayError>(GatewayError::ProviderUnavailable(format!(
                            "user key failed for '{}': {}",
                            provider, e
                        )))?;
                        None
                    }
                };
                if let Some(mut inner) = opened {
                    while let Some(item) = inner.next().await {
                        yield item?;
                    }
                }
            } else {
                let max_attempts = keys.total_keys(&provider) + 1;
                let mut last_error: Option<GatewayError> = None;
                let mut finished = false;

                for attempt in 0..max_attempts {
                    if finished {
                        break;
                    }
                    if attempt > 0 {
                        tokio::time::sleep(ATTEMPT_BACKOFF).await;
                    }
                    let lease = match KeyLease::acquire(Arc::clone(&keys), &provider).await {
                        Ok(lease) => lease,
                        Err(e @ GatewayError::KeyTimeout(_)) => {
                            warn!(provider = %provider, attempt, "all keys busy during stream attempt");
                            last_error = Some(e);
                            continue;
                        }
                        Err(e) => {
                            Err::<(), GatewayError>(e)?;
                            continue;
                        }
                    };

                    match adapter.chat_stream(&req, &profile, lease.key()).await {
                        Err(e) => {
                            let reason = e.to_string();
                            match classify(&e) {
                                Disposition::RateLimited => {
                                    lease.quarantine(&reason, QUARANTINE_TTL);
                                    warn!(provider = %provider, "429 before first chunk, fail-fast");
                                    Err::<(), GatewayError>(GatewayError::ProviderUnavailable(reason))?;
                                }
                                Disposition::AuthFailure => {
                                    lease.retire(&reason);
                                    last_error = Some(e);
                                }
                                Disposition::ServerError => {
                                    lease.quarantine(&reason, QUARANTINE_TTL);
                                    last_error = Some(e);
                                }
                                Disposition::ClientFault => {
                                    lease.release();
                                    Err::<(), GatewayError>(e)?;
                                }
                                Disposition::Transient => {
                                    lease.release();
                                    last_error = Some(e);
                                }
                            }
                        }
                        Ok(mut inner) => {
                            let mut started = false;
                            let mut stream_error: Option<GatewayError> = None;
                            while let Some(item) = inner.next().await {
                                match item {
                                    Ok(chunk) => {
                                        started = true;
                                        yield chunk;
                                    }
                                    Err(e) => {
                                        stream_error = Some(e);
                                        break;
                                    }
                                }
                            }
                            match stream_error {
                                None => {
                                    lease.release();
                                    finished = true;
                                }
                                Some(e) if started => {
                                    // Bytes are committed; the only legal
                                    // propagation is closing the stream.
                                    let reason = e.to_string();
                                    match classify(&e) {
                                        Disposition::RateLimited | Disposition::ServerError => {
                                            lease.quarantine(&reason, QUARANTINE_TTL)
                                        }
                                        Disposition::AuthFailure => lease.retire(&reason),
                                        _ => lease.release(),
                                    }
                                    warn!(provider = %provider, error = %reason, "mid-stream failure, closing");
                                    Err::<(), GatewayError>(e)?;
                                }
                                Some(e) => {
                                    let reason = e.to_string();
                                    match classify(&e) {
                                        Disposition::RateLimited => {
                                            lease.quarantine(&reason, QUARANTINE_TTL);
                                            Err::<(), GatewayError>(GatewayError::ProviderUnavailable(reason))?;
                                        }
                                        Disposition::AuthFailure => {
                                            lease.retire(&reason);
                                            last_error = Some(e);
                                        }
                                        Disposition::ServerError => {
                                            lease.quarantine(&reason, QUARANTINE_TTL);
                                            last_error = Some(e);
                                        }
                                        Disposition::ClientFault => {
                                            lease.release();
                                            Err::<(), GatewayError>(e)?;
                                        }
                                        Disposition::Transient => {
                                            lease.release();
                                            last_error = Some(e);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                if !finished {
                    Err::<(), GatewayError>(GatewayError::ProviderUnavailable(format!(
                        "streaming from '{}' failed after {} attempts: {}",
                        provider,
                        max_attempts,
                        last_error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no keys".into())
                    )))?;
                }
            }
        };
        Box::pin(stream)
    }

    pub async fn dispatch_embeddings(
        &self,
        req: &EmbeddingRequest,
        user: Option<&User>,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let config = self.config.for_user(user);
        let chain = router::resolve_chain(&config, &self.rotation, &req.model).await?;
        let mut last_error: Option<GatewayError> = None;
        for name in &chain {
            let Some(profile) = config.profile(name) else { continue };
            let adapter = self.adapters.for_provider(&profile.provider);
            let result = self
                .with_key_rotation(profile, user, async |key| {
                    adapter.embed(req, profile, &key).await
                })
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_silenceable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "all providers for '{}' are unavailable: {}",
            req.model,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "empty chain".into())
        )))
    }

    pub async fn dispatch_speech(
        &self,
        req: &SpeechRequest,
        user: Option<&User>,
    ) -> Result<AudioPayload, GatewayError> {
        let config = self.config.for_user(user);
        let chain = router::resolve_chain(&config, &self.rotation, &req.model).await?;
        let mut last_error: Option<GatewayError> = None;
        for name in &chain {
            let Some(profile) = config.profile(name) else { continue };
            let adapter = self.adapters.for_provider(&profile.provider);
            let result = self
                .with_key_rotation(profile, user, async |key| {
                    adapter.speech(req, profile, &key).await
                })
                .await;
            match result {
                Ok(audio) => return Ok(audio),
                Err(e) if e.is_silenceable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "all providers for '{}' are unavailable: {}",
            req.model,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "empty chain".into())
        )))
    }

    pub async fn dispatch_transcription(
        &self,
        model: &str,
        file_name: &str,
        bytes: Vec<u8>,
        user: Option<&User>,
    ) -> Result<TranscriptionResponse, GatewayError> {
        let config = self.config.for_user(user);
        let chain = router::resolve_chain(&config, &self.rotation, model).await?;
        let mut last_error: Option<GatewayError> = None;
        for name in &chain {
            let Some(profile) = config.profile(name) else { continue };
            let adapter = self.adapters.for_provider(&profile.provider);
            let result = self
                .with_key_rotation(profile, user, async |key| {
                    adapter
                        .transcribe(file_name, bytes.clone(), profile, &key)
                        .await
                })
                .await;
            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_silenceable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(GatewayError::ProviderUnavailable(format!(
            "all providers for '{}' are unavailable: {}",
            model,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "empty chain".into())
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::chat::ChatMessage;

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "fast".into(),
            messages: vec![ChatMessage::user("Hello")],
            stream,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            response_format: None,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn empty_messages_rejected_before_any_provider_call() {
        let engine = engine_with(&[("ok", Behavior::Ok)], &[("fast", &["p-ok"])]);
        let mut req = request(false);
        req.messages.clear();
        let err = engine.dispatch_unary(&req, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn vanilla_stream_single_provider_success() {
        let engine = engine_with(&[("ok", Behavior::Ok)], &[("fast", &["p-ok"])]);
        let stream = engine.dispatch_stream(&request(true), None).await.unwrap();
        let chunks: Vec<_> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;

        assert_eq!(chunks[0].delta().unwrap().role.as_deref(), Some("assistant"));
        assert_eq!(chunks[1].delta().unwrap().content.as_deref(), Some("Hello"));
        assert_eq!(chunks.last().unwrap().finish_reason(), Some("stop"));

        // Key returned to the pool afterwards.
        let pools = engine.keys.status();
        let status = &pools["ok"];
        assert_eq!(status.available, 1);
        assert_eq!(status.quarantined, 0);
    }

    #[tokio::test]
    async fn first_chunk_429_silently_advances() {
        let engine = engine_with(
            &[("rl", Behavior::RateLimited), ("ok", Behavior::Ok)],
            &[("coding", &["p-rl", "p-ok"])],
        );
        let mut req = request(true);
        req.model = "coding".into();
        let stream = engine.dispatch_stream(&req, None).await.unwrap();
        let chunks: Vec<_> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;

        // Client sees only the healthy provider's stream, from byte zero.
        assert_eq!(chunks[0].delta().unwrap().role.as_deref(), Some("assistant"));
        assert!(chunks.iter().all(|c| c.model == "m-ok"));

        // The rate-limited provider's key went to quarantine.
        let pools = engine.keys.status();
        let status = &pools["rl"];
        assert_eq!(status.quarantined, 1);
        assert_eq!(status.available, 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_is_terminal_not_fallback() {
        let engine = engine_with(
            &[("mid", Behavior::MidStreamFailure), ("ok", Behavior::Ok)],
            &[("coding", &["p-mid", "p-ok"])],
        );
        let mut req = request(true);
        req.model = "coding".into();
        let mut stream = engine.dispatch_stream(&req, None).await.unwrap();

        let mut contents = Vec::new();
        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(c) = chunk.delta().and_then(|d| d.content.clone()) {
                        contents.push(c);
                    }
                    assert_eq!(chunk.model, "m-mid", "no fallback once bytes flowed");
                }
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error, "stream must close with an error");
        assert_eq!(contents, vec!["partial".to_string()]);

        // The key was released (transport reset is not the key's fault).
        let pools = engine.keys.status();
        let status = &pools["mid"];
        assert_eq!(status.available, 1);
        assert_eq!(status.quarantined, 0);
        assert_eq!(status.retired, 0);
    }

    #[tokio::test]
    async fn unary_auth_failure_retires_and_moves_on() {
        let engine = engine_with(
            &[("auth", Behavior::AuthFailure), ("ok", Behavior::Ok)],
            &[("fast", &["p-auth", "p-ok"])],
        );
        let response = engine.dispatch_unary(&request(false), None).await.unwrap();
        assert_eq!(response.model, "m-ok");

        let pools = engine.keys.status();
        let status = &pools["auth"];
        assert_eq!(status.retired, 1);
        assert_eq!(status.total_keys, 0);
    }

    #[tokio::test]
    async fn bad_request_propagates_instead_of_fallback() {
        let engine = engine_with(
            &[("bad", Behavior::BadRequest), ("ok", Behavior::Ok)],
            &[("fast", &["p-bad", "p-ok"])],
        );
        let err = engine.dispatch_unary(&request(false), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));

        // 400 means the request was broken, not the key.
        let pools = engine.keys.status();
        let status = &pools["bad"];
        assert_eq!(status.available, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_is_provider_unavailable() {
        let engine = engine_with(
            &[("rl", Behavior::RateLimited)],
            &[("fast", &["p-rl"])],
        );
        let err = match engine.dispatch_stream(&request(true), None).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, GatewayError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn unknown_alias_is_alias_not_found() {
        let engine = engine_with(&[("ok", Behavior::Ok)], &[("fast", &["p-ok"])]);
        let mut req = request(false);
        req.model = "ghost".into();
        let err = engine.dispatch_unary(&req, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::AliasNotFound(_)));
    }

    #[tokio::test]
    async fn user_key_bypasses_pool_and_falls_through_on_failure() {
        let engine = engine_with(
            &[("rl", Behavior::RateLimited), ("ok", Behavior::Ok)],
            &[("fast", &["p-rl", "p-ok"])],
        );
        let user = User {
            id: "u1".into(),
            username: "dev".into(),
            provider_keys: std::collections::HashMap::from([(
                "rl".to_string(),
                "user-owned-key".to_string(),
            )]),
            config_overrides: None,
        };
        let response = engine.dispatch_unary(&request(false), Some(&user)).await.unwrap();
        assert_eq!(response.model, "m-ok");

        // The user's key is not pool-owned: nothing quarantined, the system
        // key never checked out.
        let pools = engine.keys.status();
        let status = &pools["rl"];
        assert_eq!(status.available, 1);
        assert_eq!(status.quarantined, 0);
    }

    #[tokio::test]
    async fn unary_success_caches_and_second_call_hits() {
        let engine = engine_with_cache_rules(&[("ok", Behavior::Ok)], &[("fast", &["p-ok"])]);
        let first = engine.dispatch_unary(&request(false), None).await.unwrap();
        // Drain the pool so a second provider call would fail; the cache
        // must answer instead.
        let key = engine.keys.acquire("ok").await.unwrap();
        let second = engine.dispatch_unary(&request(false), None).await.unwrap();
        engine.keys.release("ok", &key);
        assert_eq!(first.content(), second.content());
    }
}
