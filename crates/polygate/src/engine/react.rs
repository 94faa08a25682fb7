//! Structured ReAct driver.
//!
//! Prompting is a static system preamble plus a dynamic context block, both
//! rendered from a declarative pattern record. Each iteration streams the
//! model's emission, extracts `THOUGHT`/`DRAFT`/`ACTION`/`FINAL_ANSWER`
//! regions with the fuzzy parser, persists draft and phase on the session,
//! dispatches actions through the orchestrator, and echoes observations to
//! the client inside `<OBSERVATION>` blocks.
//!
//! Provider 400s are self-healing: the fuzzy parser mines the error payload
//! for structured content and re-emits whatever it finds; a second
//! consecutive format reject is terminal.

use crate::chat::{ChatCompletionChunk, ChatMessage, ChunkStream};
use crate::config::ReactPattern;
use crate::engine::driver::{
    current_date_string, driver_stream_ids, inject_context, render_placeholders, DriverContext,
    ThinkEnvelope,
};
use crate::engine::fuzzy_xml::{self, ParsedReact};
use crate::engine::MAX_AGENT_ITERATIONS;
use crate::error::GatewayError;
use async_stream::try_stream;
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

const FORMAT_REJECT_NOTE: &str = "\n<OBSERVATION>System: The previous response was rejected due to invalid format (400). Please output a valid thought or action.</OBSERVATION>\n";
const EMPTY_RESPONSE_NOTE: &str = "\n<OBSERVATION>System: The previous response was empty or invalid. Please provide a thought or action.</OBSERVATION>\n";
const RECOVERED_NOTE: &str = "\n<OBSERVATION>System Note: Previous output was recovered from malformed format. Please ensure strict XML tag closing.</OBSERVATION>\n";

const TOOL_INSTRUCTIONS: &str = r#"**TOOL USAGE:**
To use a tool, you must output a valid JSON object inside an <ACTION> tag:
<ACTION>
{
  "tool_name": "tool_name_here",
  "arguments": { "arg_name": "value" }
}
</ACTION>
"#;

fn digits_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("valid regex"))
}

/// "LAST COMPLETED PHASE / CURRENT WORKBOOK" block injected into prompts.
fn draft_context(phase: u32, draft: &str) -> String {
    let phase_text = if phase > 0 {
        format!("\n**LAST COMPLETED PHASE:** {}\n", phase)
    } else {
        "\n**LAST COMPLETED PHASE:** None (Start at Phase 1)\n".to_string()
    };
    let draft_text = if draft.is_empty() {
        "\n**CURRENT WORKBOOK (DRAFT):**\n(Empty)\n".to_string()
    } else {
        format!("\n**CURRENT WORKBOOK (DRAFT):**\n{}\n", draft)
    };
    format!("{}{}", phase_text, draft_text)
}

/// Largest number in a THOUGHT title ("Phase 3: Verify" -> 3).
fn max_phase_in_title(title: &str) -> Option<u32> {
    digits_pattern()
        .find_iter(title)
        .filter_map(|m| m.as_str().parse::<u32>().ok())
        .max()
}

/// Parses the JSON body of an `<ACTION>` block, tolerating code fences.
fn parse_action(action: &str) -> Result<(String, Value), GatewayError> {
    let mut clean = action.trim();
    if let Some(stripped) = clean.strip_prefix("```json") {
        clean = stripped;
    }
    if let Some(stripped) = clean.strip_suffix("```") {
        clean = stripped;
    }
    let clean = clean.trim();
    let value: Value = serde_json::from_str(clean).map_err(|_| {
        GatewayError::ToolError(format!(
            "could not parse JSON action: {}...",
            clean.chars().take(50).collect::<String>()
        ))
    })?;
    let tool_name = value
        .get("tool_name")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::ToolError("action has no tool_name".into()))?
        .to_string();
    let arguments = value.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));
    Ok((tool_name, arguments))
}

/// Renders recovered fragments back into tagged form, in emission order.
fn recovered_fragments(parsed: &ParsedReact) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(thought) = &parsed.thought {
        out.push(format!("<THOUGHT>{}</THOUGHT>", thought));
    }
    if let Some(draft) = &parsed.draft {
        out.push(format!("<DRAFT>{}</DRAFT>", draft));
    }
    if let Some(action) = &parsed.action {
        out.push(format!("<ACTION>{}</ACTION>", action));
    }
    if let Some(final_answer) = &parsed.final_answer {
        out.push(format!("<FINAL_ANSWER>{}</FINAL_ANSWER>", final_answer));
    }
    out
}

pub fn run_react(ctx: DriverContext, pattern: ReactPattern) -> ChunkStream {
    let stream = try_stream! {
        let (id, created) = driver_stream_ids();
        let model = ctx.request.alias.clone();
        yield ChatCompletionChunk::role(&id, created, &model);

        let mut current_draft = ctx.session.draft().await;
        let mut current_phase = ctx.session.phase().await;
        let mut draft_ctx = draft_context(current_phase, &current_draft);

        // Tools the agent may mention: client-declared first, discovery
        // otherwise.
        let tools_json = match &ctx.request.tools {
            Some(tools) if !tools.is_empty() => {
                serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".into())
            }
            _ => {
                let discovered = ctx
                    .orchestrator
                    .available_tools(ctx.allowed_tool_servers.as_deref());
                serde_json::to_string_pretty(&discovered).unwrap_or_else(|_| "[]".into())
            }
        };
        let has_tools = tools_json.trim() != "[]";

        let mut scratchpad = String::new();
        let mut consecutive_empty = 0u32;
        let mut format_rejected = false;
        let mut finished = false;

        for iteration in 0..MAX_AGENT_ITERATIONS {
            if finished {
                break;
            }
            if ctx.session.is_cancelled().await {
                info!(session = %ctx.session.session_id, "session cancelled, stopping driver");
                break;
            }
            info!(session = %ctx.session.session_id, iteration, "react driver iteration");

            let tools_section = if has_tools {
                format!("**AVAILABLE TOOLS DEFINITION (Use these tools):**\n{}", tools_json)
            } else {
                String::new()
            };
            let instructions = if has_tools { TOOL_INSTRUCTIONS } else { "" };
            let status = ctx.orchestrator.server_status_text();
            let status = if status == "." { String::new() } else { status };
            let date = current_date_string();
            let system_instruction = ctx.request.system_instruction.clone().unwrap_or_default();
            let placeholders: Vec<(&str, &str)> = vec![
                ("tools_list_text", tools_section.as_str()),
                ("server_status_text", status.as_str()),
                ("tool_instructions", instructions),
                ("current_date", date.as_str()),
                ("draft_context", draft_ctx.as_str()),
                ("system_instruction", system_instruction.as_str()),
            ];
            let static_system = render_placeholders(&pattern.static_system, &placeholders);
            let dynamic = render_placeholders(&pattern.dynamic_context, &placeholders);

            // The static system stays byte-identical across turns so the
            // provider can prefix-cache it; the dynamic block rides in the
            // first user message instead.
            let mut messages = vec![ChatMessage::system(static_system)];
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: Some(inject_context(&ctx.request.user_query, &dynamic)),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            });
            if !scratchpad.is_empty() {
                messages.push(ChatMessage::assistant(scratchpad.clone()));
                messages.push(ChatMessage::user("Proceed with the next step."));
            }

            let iter_req = ctx.iteration_request(messages, None);
            let open = ctx
                .engine
                .dispatch_stream_on_chain(&iter_req, &ctx.chain, &ctx.config, ctx.user.as_ref())
                .await;

            let mut buffer = String::new();
            let mut recovered = false;
            let mut reject_message: Option<String> = None;

            match open {
                Ok(mut inner) => {
                    let mut think = ThinkEnvelope::default();
                    let mut stream_error: Option<GatewayError> = None;
                    while let Some(item) = inner.next().await {
                        let chunk = match item {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                stream_error = Some(e);
                                break;
                            }
                        };
                        let Some(delta) = chunk.delta() else { continue };
                        if let Some(reasoning) = delta.reasoning_content.clone() {
                            for piece in think.reasoning(&reasoning) {
                                buffer.push_str(&piece);
                                yield ChatCompletionChunk::content(&id, created, &model, piece);
                            }
                        }
                        if let Some(content) = delta.content.clone() {
                            for piece in think.content(&content) {
                                buffer.push_str(&piece);
                                yield ChatCompletionChunk::content(&id, created, &model, piece);
                            }
                        }
                    }
                    if let Some(closer) = think.close() {
                        buffer.push_str(closer);
                    }
                    match stream_error {
                        None => {}
                        Some(GatewayError::BadRequest(message)) => reject_message = Some(message),
                        Some(e) => {
                            Err::<(), GatewayError>(e)?;
                            continue;
                        }
                    }
                }
                Err(GatewayError::BadRequest(message)) => reject_message = Some(message),
                Err(e) => {
                    Err::<(), GatewayError>(e)?;
                    continue;
                }
            }

            if let Some(message) = reject_message {
                warn!(error = %message, "provider rejected emission with 400");
                let rescued = fuzzy_xml::extract_from_failed_generation(&message);
                if rescued.is_empty() {
                    if format_rejected {
                        Err::<(), GatewayError>(GatewayError::BadRequest(
                            "repeated format errors (400), aborting".into(),
                        ))?;
                    }
                    format_rejected = true;
                    scratchpad.push_str(FORMAT_REJECT_NOTE);
                    continue;
                }
                info!("recovered structured content from rejected emission");
                for fragment in recovered_fragments(&rescued) {
                    buffer.push_str(&fragment);
                    yield ChatCompletionChunk::content(&id, created, &model, fragment);
                }
                recovered = true;
            }
            format_rejected = false;

            let mut parsed = fuzzy_xml::parse(&buffer);
            if parsed.is_empty() {
                let clean = buffer.trim();
                if clean.len() > 10 {
                    // Unstructured but substantive output is a thought.
                    parsed.thought = Some(clean.to_string());
                } else {
                    warn!("agent output was empty or unparseable");
                    consecutive_empty += 1;
                    if consecutive_empty >= 3 {
                        warn!("three consecutive empty emissions, stopping");
                        finished = true;
                        continue;
                    }
                    scratchpad.push_str(EMPTY_RESPONSE_NOTE);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            }
            consecutive_empty = 0;

            let mut state_updated = false;
            if let Some(draft) = &parsed.draft {
                current_draft = draft.clone();
                ctx.session.save_draft(&current_draft).await;
                scratchpad.push_str("\n<OBSERVATION>System: Draft/Notebook updated successfully.</OBSERVATION>\n");
                state_updated = true;
            }
            if let Some(title) = parsed.thought_attrs.get("title") {
                if let Some(max_phase) = max_phase_in_title(title) {
                    if max_phase > current_phase {
                        current_phase = max_phase;
                        ctx.session.save_phase(current_phase).await;
                        info!(phase = current_phase, "session phase advanced");
                        state_updated = true;
                    }
                }
            }
            if state_updated {
                draft_ctx = draft_context(current_phase, &current_draft);
            }

            scratchpad.push_str(&buffer);
            if recovered {
                scratchpad.push_str(RECOVERED_NOTE);
            }

            if parsed.final_answer.is_some() {
                info!("agent reached final answer");
                finished = true;
                continue;
            }

            if let Some(action) = &parsed.action {
                let observation = match parse_action(action) {
                    Ok((tool_name, arguments)) => {
                        info!(tool = %tool_name, "action detected");
                        let result = ctx.orchestrator.call_tool(&tool_name, arguments).await;
                        serde_json::to_string(&result).unwrap_or_else(|_| result.to_string())
                    }
                    Err(e) => format!("Invalid action: {}", e),
                };
                let block = format!("\n<OBSERVATION>{}</OBSERVATION>\n", observation);
                scratchpad.push_str(&block);
                yield ChatCompletionChunk::content(&id, created, &model, block);
            }
        }

        yield ChatCompletionChunk::finish(&id, created, &model, "stop");
    };
    Box::pin(stream)
}
