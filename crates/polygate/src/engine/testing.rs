//! Scripted adapters and engine fixtures for engine and driver tests.

use crate::cache::ResponseCache;
use crate::chat::{
    AssistantMessage, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    Choice, ChunkStream, ToolCallDelta, now_unix_seconds,
};
use crate::config::{CacheRule, GatewayConfig, ModelParams, ModelProfile, SharedConfig};
use crate::engine::ExecutionEngine;
use crate::error::GatewayError;
use crate::keys::KeyManager;
use crate::providers::media::MediaUploader;
use crate::providers::{AdapterContext, AdapterRegistry, ProviderAdapter};
use crate::rotation::RotationIndex;
use crate::secrets::SecretStore;
use crate::session::SessionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a fake provider does when called.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Role chunk, the request text echoed back, terminal stop.
    Ok,
    /// HTTP 429 before the first chunk.
    RateLimited,
    /// HTTP 401 before the first chunk.
    AuthFailure,
    /// HTTP 400 before the first chunk.
    BadRequest,
    /// One content chunk, then a transport error.
    MidStreamFailure,
    /// A scripted multi-turn agent: each call pops the next script entry.
    Script(Arc<parking_lot::Mutex<Vec<ScriptTurn>>>),
}

/// One LLM turn a scripted adapter plays back as a stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptTurn {
    pub reasoning: Vec<String>,
    pub content: Vec<String>,
    /// (index, id, name-fragment, arguments-fragment) deltas.
    pub tool_deltas: Vec<(usize, Option<String>, Option<String>, Option<String>)>,
    /// Raised instead of streaming anything.
    pub error: Option<String>,
}

pub struct FakeAdapter {
    behavior: Behavior,
}

impl FakeAdapter {
    pub fn new(behavior: Behavior) -> Self {
        FakeAdapter { behavior }
    }
}

fn last_user_text(req: &ChatCompletionRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.as_ref())
        .map(|c| c.as_text())
        .unwrap_or_default()
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    async fn chat_unary(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        _key: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let model = profile.model_params.model.clone();
        match &self.behavior {
            Behavior::Ok => Ok(ChatCompletionResponse {
                id: "resp-1".into(),
                object: "chat.completion".into(),
                created: now_unix_seconds(),
                model,
                choices: vec![Choice {
                    index: 0,
                    message: AssistantMessage {
                        role: "assistant".into(),
                        content: Some(format!("answer to: {}", last_user_text(req))),
                        reasoning_content: None,
                        tool_calls: None,
                    },
                    finish_reason: Some("stop".into()),
                }],
                usage: None,
            }),
            Behavior::RateLimited => Err(GatewayError::from_status(429, "rate limit reached")),
            Behavior::AuthFailure => Err(GatewayError::from_status(401, "invalid key")),
            Behavior::BadRequest => Err(GatewayError::from_status(400, "malformed payload")),
            Behavior::MidStreamFailure => Err(GatewayError::Http("connection reset".into())),
            Behavior::Script(_) => Err(GatewayError::Http("script is stream-only".into())),
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatCompletionRequest,
        profile: &ModelProfile,
        _key: &str,
    ) -> Result<ChunkStream, GatewayError> {
        let model = profile.model_params.model.clone();
        let id = "chunk-1".to_string();
        let created = now_unix_seconds();
        match &self.behavior {
            Behavior::Ok => {
                let text = last_user_text(req);
                let chunks = vec![
                    Ok(ChatCompletionChunk::role(&id, created, &model)),
                    Ok(ChatCompletionChunk::content(&id, created, &model, text)),
                    Ok(ChatCompletionChunk::finish(&id, created, &model, "stop")),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            Behavior::RateLimited => Err(GatewayError::from_status(429, "rate limit reached")),
            Behavior::AuthFailure => Err(GatewayError::from_status(401, "invalid key")),
            Behavior::BadRequest => Err(GatewayError::from_status(400, "malformed payload")),
            Behavior::MidStreamFailure => {
                let chunks = vec![
                    Ok(ChatCompletionChunk::role(&id, created, &model)),
                    Ok(ChatCompletionChunk::content(&id, created, &model, "partial")),
                    Err(GatewayError::Http("connection reset".into())),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            Behavior::Script(turns) => {
                let turn = {
                    let mut turns = turns.lock();
                    if turns.is_empty() {
                        ScriptTurn {
                            content: vec!["script exhausted".into()],
                            ..Default::default()
                        }
                    } else {
                        turns.remove(0)
                    }
                };
                if let Some(message) = turn.error {
                    return Err(GatewayError::BadRequest(message));
                }
                let mut chunks = vec![Ok(ChatCompletionChunk::role(&id, created, &model))];
                for r in turn.reasoning {
                    chunks.push(Ok(ChatCompletionChunk::reasoning(&id, created, &model, r)));
                }
                for c in turn.content {
                    chunks.push(Ok(ChatCompletionChunk::content(&id, created, &model, c)));
                }
                for (index, call_id, name, args) in turn.tool_deltas {
                    chunks.push(Ok(ChatCompletionChunk::tool_calls(
                        &id,
                        created,
                        &model,
                        vec![ToolCallDelta {
                            index,
                            id: call_id,
                            call_type: Some("function".into()),
                            function: Some(crate::chat::FunctionDelta {
                                name,
                                arguments: args,
                            }),
                        }],
                    )));
                }
                chunks.push(Ok(ChatCompletionChunk::finish(&id, created, &model, "stop")));
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
        }
    }
}

/// Builds an engine whose providers are scripted fakes, one pooled key each.
pub fn engine_with(
    providers: &[(&str, Behavior)],
    aliases: &[(&str, &[&str])],
) -> ExecutionEngine {
    engine_with_config(providers, aliases, GatewayConfig::default())
}

pub fn engine_with_cache_rules(
    providers: &[(&str, Behavior)],
    aliases: &[(&str, &[&str])],
) -> ExecutionEngine {
    let mut config = GatewayConfig::default();
    config.cache_settings.enabled = true;
    config.cache_settings.rules = vec![CacheRule {
        model_names: vec!["*".into()],
        include_in_key: vec!["messages".into()],
    }];
    engine_with_config(providers, aliases, config)
}

pub fn engine_with_config(
    providers: &[(&str, Behavior)],
    aliases: &[(&str, &[&str])],
    mut config: GatewayConfig,
) -> ExecutionEngine {
    let secrets = SecretStore::new();
    let keys = KeyManager::with_timeout(Arc::clone(&secrets), Duration::from_millis(100));

    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    for (provider, behavior) in providers {
        keys.add_keys(provider, vec![format!("key-{}", provider)]);
        adapters.insert(
            provider.to_string(),
            Arc::new(FakeAdapter::new(behavior.clone())),
        );
        config.model_list.push(ModelProfile {
            model_name: format!("p-{}", provider),
            provider: provider.to_string(),
            model_params: ModelParams {
                model: format!("m-{}", provider),
                ..Default::default()
            },
        });
    }
    for (alias, chain) in aliases {
        config.router_settings.model_group_alias.insert(
            alias.to_string(),
            chain.iter().map(|s| s.to_string()).collect(),
        );
    }

    let registry =
        AdapterRegistry::with_fallback(adapters, Arc::new(FakeAdapter::new(Behavior::Ok)));
    let http = reqwest::Client::new();

    ExecutionEngine {
        config: SharedConfig::new(config),
        keys,
        rotation: RotationIndex::new(None),
        adapters: registry,
        cache: ResponseCache::in_memory(),
        sessions: SessionStore::in_memory(),
        http,
    }
}

/// Builds a [`DriverContext`](crate::engine::driver::DriverContext) around a
/// scripted engine, with the given native tools registered.
pub async fn driver_context(
    engine: Arc<ExecutionEngine>,
    alias: &str,
    query: &str,
    tools: Option<Vec<crate::chat::Tool>>,
    natives: Vec<Arc<dyn crate::tools::NativeTool>>,
) -> crate::engine::driver::DriverContext {
    use crate::engine::driver::{AgentRequest, DriverContext};

    let config = engine.config.load();
    let chain = crate::router::resolve_chain(&config, &engine.rotation, alias)
        .await
        .expect("alias resolves");

    let mut registry = crate::tools::NativeToolRegistry::new();
    for tool in natives {
        registry.register(tool);
    }
    let mcp = crate::mcp::McpRegistry::new(Vec::new(), engine.http.clone(), None);
    let orchestrator = Arc::new(crate::orchestrator::ToolOrchestrator::new(
        Arc::new(registry),
        mcp,
        engine.http.clone(),
        &config,
        "sess-test",
    ));
    let session = Arc::new(engine.sessions.handle("sess-test"));

    DriverContext {
        engine,
        session,
        orchestrator,
        user: None,
        chain,
        config,
        request: AgentRequest {
            alias: alias.to_string(),
            user_query: crate::chat::MessageContent::Text(query.to_string()),
            system_instruction: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools,
        },
        allowed_tool_servers: None,
    }
}

/// An [`AdapterContext`] wired to in-memory collaborators, for adapter tests.
pub fn adapter_context() -> AdapterContext {
    let http = reqwest::Client::new();
    AdapterContext {
        http: http.clone(),
        rotation: RotationIndex::new(None),
        sessions: SessionStore::in_memory(),
        media: MediaUploader::new(http, None),
        mock_mode: false,
        gemini_cache_min_chars: 10_000,
        reasoning_models: HashMap::new(),
    }
}
