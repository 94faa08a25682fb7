//! Shared plumbing for the reasoning drivers.
//!
//! Both drivers emit the same contract: a stream of chat-completion chunks
//! whose last element carries a finish reason. Reasoning deltas are
//! bracketed into a single well-formed `<think>…</think>` envelope at
//! transition boundaries so clients see one consistent shape regardless of
//! how the provider expressed its thinking.

use crate::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ChunkStream, ContentPart,
    MessageContent, Tool, now_unix_seconds,
};
use crate::config::GatewayConfig;
use crate::engine::ExecutionEngine;
use crate::orchestrator::ToolOrchestrator;
use crate::session::SessionHandle;
use crate::User;
use async_stream::try_stream;
use futures::StreamExt;
use std::sync::Arc;
use uuid::Uuid;

/// The agent-relevant slice of an incoming chat request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub alias: String,
    pub user_query: MessageContent,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Tools declared by the client, taking precedence over discovery.
    pub tools: Option<Vec<Tool>>,
}

/// Everything one driver run needs. The context is consumed by the driver's
/// stream.
pub struct DriverContext {
    pub engine: Arc<ExecutionEngine>,
    pub session: Arc<SessionHandle>,
    pub orchestrator: Arc<ToolOrchestrator>,
    pub user: Option<User>,
    /// Chain resolved once per request; iterations reuse it.
    pub chain: Vec<String>,
    pub config: Arc<GatewayConfig>,
    pub request: AgentRequest,
    pub allowed_tool_servers: Option<Vec<String>>,
}

impl DriverContext {
    pub(crate) fn iteration_request(&self, messages: Vec<ChatMessage>, tools: Option<Vec<Tool>>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.request.alias.clone(),
            messages,
            stream: true,
            temperature: self.request.temperature,
            top_p: self.request.top_p,
            max_tokens: self.request.max_tokens,
            tools,
            tool_choice: None,
            parallel_tool_calls: None,
            response_format: None,
            extra: Default::default(),
        }
    }
}

/// Tracks whether we are inside a `<think>` envelope and produces the
/// content pieces to emit for each delta.
#[derive(Default)]
pub(crate) struct ThinkEnvelope {
    thinking: bool,
}

impl ThinkEnvelope {
    pub fn reasoning(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if !self.thinking {
            out.push("<think>".to_string());
            self.thinking = true;
        }
        out.push(text.to_string());
        out
    }

    pub fn content(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if self.thinking {
            out.push("</think>".to_string());
            self.thinking = false;
        }
        out.push(text.to_string());
        out
    }

    pub fn close(&mut self) -> Option<&'static str> {
        if self.thinking {
            self.thinking = false;
            Some("</think>")
        } else {
            None
        }
    }
}

/// Replaces `{name}` placeholders. Unknown placeholders are left alone so a
/// prompt that mentions braces survives rendering.
pub(crate) fn render_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Today's date for prompt context, RFC 3339, UTC.
pub(crate) fn current_date_string() -> String {
    let now = humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string();
    now.split('T').next().unwrap_or(&now).to_string()
}

/// Fresh id and created stamp for one driver run.
pub(crate) fn driver_stream_ids() -> (String, u64) {
    (
        format!("chatcmpl-agent-{}", Uuid::new_v4().simple()),
        now_unix_seconds(),
    )
}

/// Prepends a dynamic context block to the user's query content.
pub(crate) fn inject_context(content: &MessageContent, dynamic: &str) -> MessageContent {
    match content {
        MessageContent::Text(text) => {
            MessageContent::Text(format!("{}\n\nUser Query: {}", dynamic, text))
        }
        MessageContent::Parts(parts) => {
            let mut out = vec![ContentPart::text(format!("{}\n\nUser Query:", dynamic))];
            out.extend(parts.clone());
            MessageContent::Parts(out)
        }
    }
}

/// The plain streaming driver: no tools, no pattern, just the chain call
/// with the `<think>` envelope applied. Used when an agent profile names a
/// reasoning pattern that is not registered.
pub fn run_simple_chat(ctx: DriverContext) -> ChunkStream {
    let stream = try_stream! {
        let (id, created) = driver_stream_ids();
        let model = ctx.request.alias.clone();
        yield ChatCompletionChunk::role(&id, created, &model);

        let mut messages = Vec::new();
        if let Some(system) = &ctx.request.system_instruction {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(ctx.request.user_query.clone()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        });

        let iter_req = ctx.iteration_request(messages, None);
        let mut inner = ctx
            .engine
            .dispatch_stream_on_chain(&iter_req, &ctx.chain, &ctx.config, ctx.user.as_ref())
            .await?;

        let mut think = ThinkEnvelope::default();
        while let Some(item) = inner.next().await {
            let chunk = item?;
            let Some(delta) = chunk.delta() else { continue };
            if let Some(reasoning) = delta.reasoning_content.clone() {
                for piece in think.reasoning(&reasoning) {
                    yield ChatCompletionChunk::content(&id, created, &model, piece);
                }
            }
            if let Some(content) = delta.content.clone() {
                for piece in think.content(&content) {
                    yield ChatCompletionChunk::content(&id, created, &model, piece);
                }
            }
        }
        if let Some(closer) = think.close() {
            yield ChatCompletionChunk::content(&id, created, &model, closer);
        }
        yield ChatCompletionChunk::finish(&id, created, &model, "stop");
    };
    Box::pin(stream)
}
