//! Fingerprint-keyed response cache for non-streaming chat.
//!
//! The fingerprint is a sha256 over the request's whitelisted fields
//! (canonicalized so key order never matters) plus the profile name.
//! Admission is validated on write *and* on read: a cached value that no
//! longer passes the rules is silently ignored, never returned.

use crate::chat::{ChatCompletionRequest, ChatCompletionResponse};
use crate::config::{CacheSettings, ModelProfile};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Error shapes that must never be served from cache.
const ERROR_SIGNATURES: &[&str] = &[
    "Internal Server Error",
    "Rate limit reached",
    "Quota exceeded",
    "error sending request",
    "operation timed out",
    "Parsing failed. The model generated output that could not be parsed",
];

/// Plain TTL'd key/value store; the cache holds no semantics beyond this.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expiry)) if Instant::now() >= *expiry => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

/// Recursively sorts object keys so serialization is order-independent.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Computes the cache key for a request, or `None` when no rule admits it.
pub fn fingerprint(
    req: &ChatCompletionRequest,
    profile: &ModelProfile,
    settings: &CacheSettings,
) -> Option<String> {
    if !settings.enabled {
        return None;
    }
    let rule = settings.rules.iter().find(|rule| {
        rule.model_names.iter().any(|name| name == "*" || name == &profile.model_name)
    })?;

    let request_value = serde_json::to_value(req).ok()?;
    let request_map = request_value.as_object()?;

    let mut key_fields = serde_json::Map::new();
    for field in &rule.include_in_key {
        if let Some(value) = request_map.get(field.as_str()) {
            if !value.is_null() {
                key_fields.insert(field.clone(), value.clone());
            }
        }
    }
    if key_fields.is_empty() {
        return None;
    }
    // The profile name always participates so two profiles can never collide.
    key_fields.insert(
        "profile_name".to_string(),
        Value::String(profile.model_name.clone()),
    );

    let canonical = canonicalize(&Value::Object(key_fields)).to_string();
    Some(format!(
        "{}{}",
        settings.key_prefix,
        hex::encode(Sha256::digest(canonical.as_bytes()))
    ))
}

/// Admission rules: non-blank, no error signatures, and not a JSON error
/// object.
pub fn is_safe_to_cache(content: &str) -> bool {
    if content.trim().is_empty() {
        warn!("cache rejection: content is empty");
        return false;
    }
    for signature in ERROR_SIGNATURES {
        if content.contains(signature) {
            warn!(signature = %signature, "cache rejection: error signature");
            return false;
        }
    }
    let trimmed = content.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            if map.contains_key("error") {
                warn!("cache rejection: JSON error object");
                return false;
            }
            if map
                .get("status_code")
                .and_then(Value::as_u64)
                .is_some_and(|code| code >= 400)
            {
                warn!("cache rejection: failure status_code");
                return false;
            }
        }
    }
    true
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        ResponseCache { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::default()))
    }

    /// Cache lookup with re-validation; unsafe or undecodable hits are
    /// ignored.
    pub async fn read(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        settings: &CacheSettings,
    ) -> Option<ChatCompletionResponse> {
        let key = fingerprint(req, profile, settings)?;
        let cached = self.store.get(&key).await?;
        let content_ok = serde_json::from_str::<ChatCompletionResponse>(&cached)
            .ok()
            .filter(|resp| resp.content().map_or(false, is_safe_to_cache));
        match content_ok {
            Some(resp) => {
                info!(alias = %req.model, "response cache hit");
                Some(resp)
            }
            None => {
                warn!(alias = %req.model, "cache hit with unsafe or invalid content, ignoring");
                None
            }
        }
    }

    /// Validated write; responses that fail admission are skipped.
    pub async fn write(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        settings: &CacheSettings,
        response: &ChatCompletionResponse,
    ) {
        let Some(key) = fingerprint(req, profile, settings) else { return };
        let Some(content) = response.content() else {
            warn!(alias = %req.model, "skipping cache write: response has no content");
            return;
        };
        if !is_safe_to_cache(content) {
            warn!(alias = %req.model, "skipping cache write: content deemed unsafe");
            return;
        }
        match serde_json::to_string(response) {
            Ok(serialized) => {
                self.store
                    .set(&key, serialized, Duration::from_secs(settings.ttl_seconds))
                    .await;
                info!(alias = %req.model, "response cached");
            }
            Err(e) => warn!(error = %e, "cache serialization failed"),
        }
    }
}
