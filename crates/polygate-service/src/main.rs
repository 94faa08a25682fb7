//! OpenAI-compatible HTTP surface for the polygate dispatch engine.
//!
//! One axum router fronts chat (unary + SSE), embeddings, speech,
//! transcription, the runnable-model listing, and the auxiliary auth/user
//! endpoints. A request counts as agent work when the alias's head profile
//! declares a reasoning mode or the request carries tool definitions; those
//! go to a reasoning driver, everything else goes straight through the
//! execution engine.

use anyhow::{Context, Result};
use axum::{
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures::StreamExt;
use parking_lot::RwLock;
use polygate::cache::ResponseCache;
use polygate::chat::{
    ChatCompletionRequest, ChunkStream, EmbeddingRequest, MessageContent, SpeechRequest,
};
use polygate::config::{load_patterns, GatewayConfig, ReactPattern, SharedConfig};
use polygate::engine::driver::{run_simple_chat, AgentRequest, DriverContext};
use polygate::engine::native::run_native;
use polygate::engine::react::run_react;
use polygate::engine::ExecutionEngine;
use polygate::error::GatewayError;
use polygate::keys::KeyManager;
use polygate::mcp::McpRegistry;
use polygate::orchestrator::ToolOrchestrator;
use polygate::providers::media::MediaUploader;
use polygate::providers::{AdapterContext, AdapterRegistry};
use polygate::rotation::RotationIndex;
use polygate::router::runnable_models;
use polygate::secrets::SecretStore;
use polygate::session::{SessionHandle, SessionStore};
use polygate::tools::NativeToolRegistry;
use polygate::User;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the gateway config file
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,
    /// Require registered bearer tokens on every request
    #[arg(long, env = "POLYGATE_AUTH_ENABLED")]
    auth_enabled: bool,
    /// Serve scripted streams instead of calling providers (load tests)
    #[arg(long, env = "POLYGATE_MOCK_MODE")]
    mock_mode: bool,
    /// External media uploader endpoint for base64 image externalization
    #[arg(long, env = "POLYGATE_MEDIA_UPLOADER_URL")]
    media_uploader_url: Option<String>,
}

/// Minimal in-memory account registry: enough for bearer auth, per-user
/// provider keys and config overrides. Durable account storage is an
/// external collaborator.
#[derive(Default)]
struct UserRegistry {
    by_token: RwLock<HashMap<String, User>>,
}

impl UserRegistry {
    fn register(&self, username: &str) -> (String, User) {
        let token = format!("pg-{}", Uuid::new_v4().simple());
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            provider_keys: HashMap::new(),
            config_overrides: None,
        };
        self.by_token.write().insert(token.clone(), user.clone());
        (token, user)
    }

    fn get(&self, token: &str) -> Option<User> {
        self.by_token.read().get(token).cloned()
    }

    fn set_provider_key(&self, token: &str, provider: &str, key: &str) -> Option<User> {
        let mut users = self.by_token.write();
        let user = users.get_mut(token)?;
        user.provider_keys.insert(provider.to_string(), key.to_string());
        Some(user.clone())
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<ExecutionEngine>,
    mcp: Arc<McpRegistry>,
    native_tools: Arc<NativeToolRegistry>,
    patterns: Arc<HashMap<String, ReactPattern>>,
    users: Arc<UserRegistry>,
    secrets: Arc<SecretStore>,
    auth_enabled: bool,
    config_path: Arc<PathBuf>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Resolves the caller. With auth enabled the token must be registered;
/// with auth disabled any (or no) token is accepted as anonymous.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Option<User>, Response> {
    let token = bearer_token(headers);
    match (&token, state.auth_enabled) {
        (Some(token), _) => match state.users.get(token) {
            Some(user) => Ok(Some(user)),
            None if state.auth_enabled => Err(error_response(&GatewayError::Status {
                status: 401,
                message: "unknown bearer token".into(),
            })),
            None => Ok(None),
        },
        (None, true) => Err(error_response(&GatewayError::Status {
            status: 401,
            message: "missing authorization".into(),
        })),
        (None, false) => Ok(None),
    }
}

fn error_response(e: &GatewayError) -> Response {
    let (status, kind) = match e {
        GatewayError::AliasNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        GatewayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        GatewayError::ProviderUnavailable(_) | GatewayError::KeyTimeout(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        GatewayError::LeaseLost(_) => (StatusCode::CONFLICT, "retryable_error"),
        GatewayError::Status { status, .. } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "provider_error",
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
    };
    (
        status,
        Json(json!({"error": {"message": e.to_string(), "type": kind}})),
    )
        .into_response()
}

/// Releases a session lease when the response stream is done. If the client
/// disconnects mid-stream the guard fires from `Drop` on a background task;
/// the lease TTL covers the pathological cases.
struct LeaseGuard {
    handle: Option<Arc<SessionHandle>>,
}

impl LeaseGuard {
    fn new(handle: Arc<SessionHandle>) -> Self {
        LeaseGuard {
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release_lease().await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move { handle.release_lease().await });
        }
    }
}

/// Renders a chunk stream as `data: <chunk>\n\n` events terminated by
/// `data: [DONE]\n\n`. A mid-stream error closes the stream after an error
/// event; there is no fallback once bytes have flowed.
fn sse_response(chunks: ChunkStream, guard: Option<LeaseGuard>) -> Response {
    let stream = async_stream::stream! {
        futures::pin_mut!(chunks);
        let mut errored = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".into());
                    yield Ok::<_, Infallible>(Event::default().data(data));
                }
                Err(e) => {
                    error!(error = %e, "stream terminated by error");
                    let data = json!({"error": {"message": e.to_string(), "type": "server_error"}});
                    yield Ok(Event::default().data(data.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    errored = true;
                    break;
                }
            }
        }
        if !errored {
            yield Ok(Event::default().data("[DONE]"));
        }
        if let Some(guard) = guard {
            guard.release().await;
        }
    };
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

/// Splits an incoming chat request into the agent driver's view of it.
fn agent_request(req: &ChatCompletionRequest) -> AgentRequest {
    let user_query = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.clone())
        .unwrap_or(MessageContent::Text(String::new()));
    let system_instruction = req
        .messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| m.content.as_ref())
        .map(|c| c.as_text());
    AgentRequest {
        alias: req.model.clone(),
        user_query,
        system_instruction,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        tools: req.tools.clone(),
    }
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if req.messages.is_empty() {
        return error_response(&GatewayError::BadRequest("messages must not be empty".into()));
    }

    let config = state.engine.config.for_user(user.as_ref());

    // The agent decision reads the raw chain head without advancing the
    // rotation; the chain itself is resolved exactly once per request.
    let Some(raw_chain) = config.router_settings.model_group_alias.get(&req.model) else {
        return error_response(&GatewayError::AliasNotFound(req.model.clone()));
    };
    let head_settings = raw_chain
        .first()
        .and_then(|name| config.profile(name))
        .and_then(|p| p.model_params.agent_settings.clone());
    let reasoning_mode = head_settings.as_ref().and_then(|a| a.reasoning_mode.clone());
    let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
    let is_agent = reasoning_mode.is_some() || has_tools;

    if !is_agent {
        return if req.stream {
            match state.engine.dispatch_stream(&req, user.as_ref()).await {
                Ok(chunks) => sse_response(chunks, None),
                Err(e) => error_response(&e),
            }
        } else {
            match state.engine.dispatch_unary(&req, user.as_ref()).await {
                Ok(response) => Json(response).into_response(),
                Err(e) => error_response(&e),
            }
        };
    }

    info!(alias = %req.model, mode = ?reasoning_mode, "dispatching agent request");
    let session_id = format!("oai-session-{}", Uuid::new_v4());
    let session = Arc::new(state.engine.sessions.handle(&session_id));
    if !session.acquire_lease().await {
        return error_response(&GatewayError::LeaseLost(session_id));
    }

    let chain = match polygate::router::resolve_chain(&config, &state.engine.rotation, &req.model).await
    {
        Ok(chain) => chain,
        Err(e) => {
            LeaseGuard::new(Arc::clone(&session)).release().await;
            return error_response(&e);
        }
    };

    let orchestrator = Arc::new(ToolOrchestrator::new(
        Arc::clone(&state.native_tools),
        Arc::clone(&state.mcp),
        state.engine.http.clone(),
        &config,
        &session_id,
    ));
    let ctx = DriverContext {
        engine: Arc::clone(&state.engine),
        session: Arc::clone(&session),
        orchestrator,
        user,
        chain,
        config,
        allowed_tool_servers: head_settings.and_then(|a| a.allowed_tool_servers),
        request: agent_request(&req),
    };

    let driver = match reasoning_mode.as_deref() {
        Some("native_tool_calling") | None => run_native(ctx),
        Some(mode) => match state.patterns.get(mode) {
            Some(pattern) => run_react(ctx, pattern.clone()),
            None => {
                warn!(mode = %mode, "reasoning pattern not registered, degrading to plain chat");
                run_simple_chat(ctx)
            }
        },
    };
    sse_response(driver, Some(LeaseGuard::new(session)))
}

async fn handle_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let config = state.engine.config.for_user(user.as_ref());
    let data: Vec<Value> = runnable_models(&config)
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": "polygate",
                "is_agent": m.is_agent,
                "reasoning_mode": m.reasoning_mode,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn handle_embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EmbeddingRequest>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.engine.dispatch_embeddings(&req, user.as_ref()).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SpeechRequest>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.engine.dispatch_speech(&req, user.as_ref()).await {
        Ok(audio) => (
            [(header::CONTENT_TYPE, audio.media_type)],
            audio.bytes,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_transcriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let mut model: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("model") => {
                model = field.text().await.ok();
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or("audio.wav").to_string();
                if let Ok(bytes) = field.bytes().await {
                    file = Some((file_name, bytes.to_vec()));
                }
            }
            _ => {}
        }
    }
    let Some(model) = model else {
        return error_response(&GatewayError::BadRequest("model field is required".into()));
    };
    let Some((file_name, bytes)) = file else {
        return error_response(&GatewayError::BadRequest("file field is required".into()));
    };

    match state
        .engine
        .dispatch_transcription(&model, &file_name, bytes, user.as_ref())
        .await
    {
        Ok(text) => Json(text).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_mcp_refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate(&state, &headers) {
        return resp;
    }
    state.mcp.refresh().await;
    let online: Vec<String> = state
        .mcp
        .online_servers()
        .into_iter()
        .map(|s| s.name)
        .collect();
    Json(json!({"status": "ok", "online_servers": online})).into_response()
}

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Response {
    let (token, user) = state.users.register(&body.username);
    info!(username = %user.username, "registered user");
    Json(json!({"token": token, "user": user})).into_response()
}

#[derive(Deserialize)]
struct UserKeyBody {
    provider: String,
    key: String,
}

async fn handle_user_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserKeyBody>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(&GatewayError::Status {
            status: 401,
            message: "missing authorization".into(),
        });
    };
    match state.users.set_provider_key(&token, &body.provider, &body.key) {
        Some(user) => {
            // User keys never hit the pool but they must never hit the logs
            // either.
            state.secrets.register([body.key]);
            Json(json!({"status": "ok", "user": user})).into_response()
        }
        None => error_response(&GatewayError::Status {
            status: 401,
            message: "unknown bearer token".into(),
        }),
    }
}

async fn handle_user_me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(&GatewayError::Status {
                status: 401,
                message: "unknown bearer token".into(),
            })
        }
        Err(resp) => return resp,
    };
    Json(json!({"user": user})).into_response()
}

async fn handle_key_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate(&state, &headers) {
        return resp;
    }
    Json(json!({"pools": state.engine.keys.status()})).into_response()
}

/// Re-reads the config file and swaps the active configuration atomically.
/// In-flight requests keep the snapshot they started with.
async fn handle_config_reload(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate(&state, &headers) {
        return resp;
    }
    match GatewayConfig::from_file(&state.config_path) {
        Ok(config) => {
            state.engine.rotation.seed_variants(&config.model_aliases);
            state.engine.config.store(config);
            Json(json!({"status": "reloaded"})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_session_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Path(session_id): axum::extract::Path<String>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers) {
        return resp;
    }
    let cancelled = state.engine.sessions.cancel(&session_id).await;
    Json(json!({"session_id": session_id, "cancelled": cancelled})).into_response()
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/v1/audio/speech", post(handle_speech))
        .route("/v1/audio/transcriptions", post(handle_transcriptions))
        .route("/v1/mcp/refresh", post(handle_mcp_refresh))
        .route("/v1/auth/register", post(handle_register))
        .route("/v1/user/keys", post(handle_user_keys))
        .route("/v1/user/me", get(handle_user_me))
        .route("/admin/keys/status", get(handle_key_status))
        .route("/admin/sessions/:session_id/cancel", post(handle_session_cancel))
        .route("/admin/config/reload", post(handle_config_reload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let secrets = SecretStore::new();
    let keys = KeyManager::new(Arc::clone(&secrets));
    if config.keys_dir.exists() {
        keys.load_from_dir(&config.keys_dir)
            .context("loading provider key files")?;
    } else {
        warn!(dir = %config.keys_dir.display(), "keys directory missing, pools start empty");
    }

    let patterns = config
        .patterns_dir
        .as_ref()
        .map(|dir| load_patterns(dir))
        .unwrap_or_default();
    info!(patterns = patterns.len(), "reasoning patterns registered");

    // One process-wide HTTP client, shared by adapters and tool calls.
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let rotation = RotationIndex::new(None);
    rotation.seed_variants(&config.model_aliases);
    let sessions = SessionStore::in_memory();
    let media = MediaUploader::new(http.clone(), args.media_uploader_url.clone());

    let adapter_ctx = AdapterContext {
        http: http.clone(),
        rotation: Arc::clone(&rotation),
        sessions: Arc::clone(&sessions),
        media,
        mock_mode: args.mock_mode,
        gemini_cache_min_chars: config.gemini_cache_min_chars,
        reasoning_models: config.reasoning_models.clone(),
    };
    let adapters = AdapterRegistry::standard(adapter_ctx);

    let mcp = McpRegistry::new(
        config.mcp_servers.clone(),
        http.clone(),
        config.mcp_tools_file.clone(),
    );

    let shared_config = SharedConfig::new(config);
    let engine = Arc::new(ExecutionEngine {
        config: shared_config,
        keys: Arc::clone(&keys),
        rotation,
        adapters,
        cache: ResponseCache::in_memory(),
        sessions,
        http: http.clone(),
    });

    let state = AppState {
        engine,
        mcp: Arc::clone(&mcp),
        native_tools: Arc::new(NativeToolRegistry::new()),
        patterns: Arc::new(patterns),
        users: Arc::new(UserRegistry::default()),
        secrets,
        auth_enabled: args.auth_enabled,
        config_path: Arc::new(args.config.clone()),
    };

    // Background work: quarantine sweeper, MCP probe + settings watcher.
    let _sweeper = keys.spawn_sweeper();
    let _watcher = mcp.spawn_watcher();
    {
        let mcp = Arc::clone(&mcp);
        tokio::spawn(async move { mcp.refresh().await });
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!(addr = %args.addr, "polygate service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving")?;

    Ok(())
}
