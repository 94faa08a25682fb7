//! Native tool-calling driver.
//!
//! One state: the message list. Each iteration streams the model's reply,
//! accumulating text and delta tool calls by index. No accumulated calls
//! means the reply is the final answer; otherwise every call is dispatched
//! in parallel, results are appended as `tool` messages, and the loop
//! continues. Bounded by [`MAX_AGENT_ITERATIONS`].
//!
//! When a scheduled tool is marked long-running, a sibling task drips
//! scripted waiting messages into the stream until the batch completes; a
//! blank-line separator then makes sure the model's next reply starts fresh.

use crate::chat::{ChatCompletionChunk, ChatMessage, MessageContent, Tool};
use crate::chat::ChunkStream;
use crate::engine::driver::{
    current_date_string, driver_stream_ids, render_placeholders, DriverContext, ThinkEnvelope,
};
use crate::engine::MAX_AGENT_ITERATIONS;
use crate::error::GatewayError;
use crate::orchestrator::ToolOrchestrator;
use crate::ToolCall;
use async_stream::try_stream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accumulator for one delta tool call, keyed by index.
#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Merges streamed tool-call deltas: names and arguments concatenate, the
/// id takes the last non-empty value.
fn accumulate_tool_delta(
    acc: &mut BTreeMap<usize, PartialToolCall>,
    deltas: &[crate::chat::ToolCallDelta],
) {
    for delta in deltas {
        let entry = acc.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            if !id.is_empty() {
                entry.id = id.clone();
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                entry.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                entry.arguments.push_str(arguments);
            }
        }
    }
}

/// A provider 400 carrying a tool-validation payload can be recovered by
/// telling the model what it did wrong and looping.
fn recovery_message(error: &str) -> Option<ChatMessage> {
    if !error.contains("tool_use_failed") && !error.contains("failed_generation") {
        return None;
    }
    if let Some(idx) = error.find("Details: ") {
        if let Ok(details) = serde_json::from_str::<Value>(&error[idx + "Details: ".len()..]) {
            let message = details
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Tool validation failed.");
            if let Some(failed) = details.get("failed_generation").and_then(Value::as_str) {
                return Some(ChatMessage::user(format!(
                    "SYSTEM ERROR: Your previous tool call caused a validation error: {}.\nFailed generation: {}\nPlease correct your arguments or use a different tool.",
                    message, failed
                )));
            }
            return Some(ChatMessage::user(format!(
                "SYSTEM ERROR: Your previous request was rejected: {}. Please try again.",
                message
            )));
        }
    }
    Some(ChatMessage::user(format!(
        "SYSTEM ERROR: Your previous request was rejected by the provider. Error: {}. Please try again with valid tool usage.",
        error
    )))
}

fn enriched_system_prompt(ctx: &DriverContext, tools: &[Tool]) -> String {
    let template = ctx.request.system_instruction.clone().unwrap_or_default();
    let tools_text = if tools.is_empty() {
        String::new()
    } else {
        format!(
            "**AVAILABLE TOOLS DEFINITION (Use these tools):**\n{}",
            serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".into())
        )
    };
    let instructions = if tools.is_empty() {
        String::new()
    } else {
        "**TOOL USAGE:**\nTo use a tool, you must use the native function calling capability of the model.".to_string()
    };
    let status = ctx.orchestrator.server_status_text();
    let status = if status == "." { String::new() } else { status };
    render_placeholders(
        &template,
        &[
            ("tools_list_text", tools_text.as_str()),
            ("server_status_text", status.as_str()),
            ("tool_instructions", instructions.as_str()),
            ("current_date", current_date_string().as_str()),
            ("draft_context", ""),
        ],
    )
}

/// Client-declared tools win; otherwise discovery (active MCP ∪ enabled
/// native) supplies the list.
fn available_tools(ctx: &DriverContext) -> Vec<Tool> {
    if let Some(tools) = &ctx.request.tools {
        if !tools.is_empty() {
            return tools.clone();
        }
    }
    ctx.orchestrator
        .available_tools(ctx.allowed_tool_servers.as_deref())
        .into_iter()
        .filter_map(|value| serde_json::from_value::<Tool>(value).ok())
        .collect()
}

async fn dispatch_one(
    orchestrator: Arc<ToolOrchestrator>,
    call: PartialToolCall,
) -> (String, String, Value) {
    let result = match serde_json::from_str::<Value>(if call.arguments.is_empty() {
        "{}"
    } else {
        &call.arguments
    }) {
        Ok(args) => orchestrator.call_tool(&call.name, args).await,
        Err(e) => {
            warn!(tool = %call.name, error = %e, "failed to parse tool arguments");
            serde_json::json!({
                "error": format!("invalid arguments '{}': {}", call.arguments, e)
            })
        }
    };
    (call.id, call.name, result)
}

pub fn run_native(ctx: DriverContext) -> ChunkStream {
    let stream = try_stream! {
        let (id, created) = driver_stream_ids();
        let model = ctx.request.alias.clone();
        yield ChatCompletionChunk::role(&id, created, &model);

        let tools = available_tools(&ctx);
        let tool_payload = (!tools.is_empty()).then(|| tools.clone());

        let mut messages = vec![
            ChatMessage::system(enriched_system_prompt(&ctx, &tools)),
            ChatMessage {
                role: "user".to_string(),
                content: Some(ctx.request.user_query.clone()),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
        ];

        let mut finished = false;
        for iteration in 0..MAX_AGENT_ITERATIONS {
            if finished {
                break;
            }
            if ctx.session.is_cancelled().await {
                info!(session = %ctx.session.session_id, "session cancelled, stopping driver");
                break;
            }
            debug!(session = %ctx.session.session_id, iteration, "native driver iteration");

            let iter_req = ctx.iteration_request(messages.clone(), tool_payload.clone());
            let open = ctx
                .engine
                .dispatch_stream_on_chain(&iter_req, &ctx.chain, &ctx.config, ctx.user.as_ref())
                .await;
            let mut inner = match open {
                Ok(inner) => inner,
                Err(GatewayError::BadRequest(message)) => match recovery_message(&message) {
                    Some(note) => {
                        warn!("recovering from provider tool-validation reject");
                        messages.push(note);
                        continue;
                    }
                    None => {
                        Err::<(), GatewayError>(GatewayError::BadRequest(message))?;
                        continue;
                    }
                },
                Err(e) => {
                    Err::<(), GatewayError>(e)?;
                    continue;
                }
            };

            let mut think = ThinkEnvelope::default();
            let mut buffer = String::new();
            let mut accumulated: BTreeMap<usize, PartialToolCall> = BTreeMap::new();
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
                if let Some(deltas) = &delta.tool_calls {
                    accumulate_tool_delta(&mut accumulated, deltas);
                }
            }
            if let Some(e) = stream_error {
                match e {
                    GatewayError::BadRequest(message) => match recovery_message(&message) {
                        Some(note) => {
                            warn!("recovering from in-stream tool-validation reject");
                            messages.push(note);
                            continue;
                        }
                        None => {
                            Err::<(), GatewayError>(GatewayError::BadRequest(message))?;
                            continue;
                        }
                    },
                    other => {
                        Err::<(), GatewayError>(other)?;
                        continue;
                    }
                }
            }
            if let Some(closer) = think.close() {
                buffer.push_str(closer);
                yield ChatCompletionChunk::content(&id, created, &model, closer);
            }

            if accumulated.is_empty() {
                // No tool calls: this was the final answer.
                finished = true;
                continue;
            }

            // Missing ids are synthesized so the tool messages can refer
            // back to their calls.
            let calls: Vec<PartialToolCall> = accumulated
                .into_values()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]);
                        warn!(tool = %call.name, id = %call.id, "generated missing tool_call_id");
                    }
                    call
                })
                .collect();

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: (!buffer.is_empty()).then(|| MessageContent::Text(buffer.clone())),
                name: None,
                tool_call_id: None,
                tool_calls: Some(
                    calls
                        .iter()
                        .map(|c| ToolCall::function(&c.id, &c.name, &c.arguments))
                        .collect(),
                ),
            });

            let has_long_running = calls.iter().any(|c| ctx.orchestrator.is_long_running(&c.name));
            let futures: Vec<_> = calls
                .into_iter()
                .map(|call| dispatch_one(Arc::clone(&ctx.orchestrator), call))
                .collect();
            let mut batch = Box::pin(futures::future::join_all(futures));

            let results = if has_long_running {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
                let schedule = ctx.config.waiting_messages.clone();
                let notifier = tokio::spawn(async move {
                    for step in schedule {
                        if step.delay_secs > 0 {
                            tokio::time::sleep(Duration::from_secs(step.delay_secs)).await;
                        }
                        if tx.send(step.message).is_err() {
                            break;
                        }
                    }
                });
                let results = loop {
                    match tokio::time::timeout(Duration::from_millis(50), &mut batch).await {
                        Ok(results) => break results,
                        Err(_) => {
                            while let Ok(message) = rx.try_recv() {
                                yield ChatCompletionChunk::content(&id, created, &model, message);
                            }
                        }
                    }
                };
                notifier.abort();
                // Separator so the model's next reply starts on a fresh line.
                yield ChatCompletionChunk::content(&id, created, &model, "\n\n");
                results
            } else {
                batch.await
            };

            for (call_id, name, result) in results {
                let content = serde_json::to_string(&result).unwrap_or_else(|_| result.to_string());
                messages.push(ChatMessage::tool_result(call_id, name, content));
            }
        }

        yield ChatCompletionChunk::finish(&id, created, &model, "stop");
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCallDelta;

    #[test]
    fn deltas_accumulate_across_pieces() {
        let mut acc = BTreeMap::new();
        let deltas = [
            ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                call_type: Some("function".into()),
                function: Some(crate::chat::FunctionDelta {
                    name: Some("smart".into()),
                    arguments: None,
                }),
            },
            ToolCallDelta {
                index: 0,
                id: None,
                call_type: None,
                function: Some(crate::chat::FunctionDelta {
                    name: Some("_search".into()),
                    arguments: Some("{\"query\":\"".into()),
                }),
            },
            ToolCallDelta {
                index: 0,
                id: None,
                call_type: None,
                function: Some(crate::chat::FunctionDelta {
                    name: None,
                    arguments: Some("foo\"}".into()),
                }),
            },
        ];
        accumulate_tool_delta(&mut acc, &deltas);
        let call = &acc[&0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "smart_search");
        assert_eq!(call.arguments, "{\"query\":\"foo\"}");
    }

    #[test]
    fn parallel_calls_keep_index_order() {
        let mut acc = BTreeMap::new();
        accumulate_tool_delta(
            &mut acc,
            &[
                ToolCallDelta {
                    index: 1,
                    id: Some("b".into()),
                    function: Some(crate::chat::FunctionDelta {
                        name: Some("second".into()),
                        arguments: Some("{}".into()),
                    }),
                    ..Default::default()
                },
                ToolCallDelta {
                    index: 0,
                    id: Some("a".into()),
                    function: Some(crate::chat::FunctionDelta {
                        name: Some("first".into()),
                        arguments: Some("{}".into()),
                    }),
                    ..Default::default()
                },
            ],
        );
        let names: Vec<&str> = acc.values().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn tool_roundtrip_then_final_answer() {
        use crate::engine::testing::{driver_context, engine_with, Behavior, ScriptTurn};
        use crate::tools::testing::RecordingTool;

        let script = Arc::new(parking_lot::Mutex::new(vec![
            // Turn 1: the model streams a fragmented smart_search call.
            ScriptTurn {
                tool_deltas: vec![
                    (0, Some("call_1".into()), Some("smart".into()), None),
                    (0, None, Some("_search".into()), Some("{\"query\":\"".into())),
                    (0, None, None, Some("foo\"}".into())),
                ],
                ..Default::default()
            },
            // Turn 2: final answer, no tool calls.
            ScriptTurn {
                content: vec!["All done.".into()],
                ..Default::default()
            },
        ]));
        let engine = Arc::new(engine_with(
            &[("scripted", Behavior::Script(script))],
            &[("agent", &["p-scripted"])],
        ));
        let (tool, calls) = RecordingTool::new("smart_search");
        let ctx = driver_context(Arc::clone(&engine), "agent", "find foo", None, vec![tool]).await;

        let chunks: Vec<_> = run_native(ctx)
            .map(|c| c.unwrap())
            .collect::<Vec<_>>()
            .await;

        let recorded = calls.lock();
        assert_eq!(recorded.len(), 1, "accumulated call dispatched once");
        assert_eq!(recorded[0]["query"], "foo");

        let text: String = chunks
            .iter()
            .filter_map(|c| c.delta().and_then(|d| d.content.clone()))
            .collect();
        assert!(text.contains("All done."));
        assert_eq!(chunks.last().unwrap().finish_reason(), Some("stop"));
    }

    #[tokio::test]
    async fn long_running_tool_drips_waiting_messages() {
        use crate::engine::testing::{driver_context, engine_with_config, Behavior, ScriptTurn};
        use crate::tools::testing::RecordingTool;
        use crate::config::{GatewayConfig, WaitingMessage};

        let script = Arc::new(parking_lot::Mutex::new(vec![
            ScriptTurn {
                tool_deltas: vec![(
                    0,
                    Some("call_1".into()),
                    Some("smart_search".into()),
                    Some("{}".into()),
                )],
                ..Default::default()
            },
            ScriptTurn {
                content: vec!["found it".into()],
                ..Default::default()
            },
        ]));
        let mut config = GatewayConfig::default();
        config.waiting_messages = vec![WaitingMessage {
            delay_secs: 0,
            message: "> still searching...".into(),
        }];
        let engine = Arc::new(engine_with_config(
            &[("scripted", Behavior::Script(script))],
            &[("agent", &["p-scripted"])],
            config,
        ));

        let (tool, _calls) = RecordingTool::new("smart_search");
        // Slow + long-running: the notifier gets a window to fire.
        let tool = Arc::new(RecordingTool {
            name: "smart_search".into(),
            long_running: true,
            delay_ms: 200,
            calls: Arc::clone(&tool.calls),
        });
        let ctx = driver_context(Arc::clone(&engine), "agent", "search", None, vec![tool]).await;

        let chunks: Vec<_> = run_native(ctx)
            .map(|c| c.unwrap())
            .collect::<Vec<_>>()
            .await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.delta().and_then(|d| d.content.clone()))
            .collect();
        assert!(text.contains("> still searching..."));
        let wait_pos = text.find("> still searching...").unwrap();
        let sep_pos = text[wait_pos..].find("\n\n").map(|p| p + wait_pos);
        assert!(sep_pos.is_some(), "separator follows the waiting banner");
        assert!(text.contains("found it"));
    }

    #[tokio::test]
    async fn validation_reject_injects_recovery_and_loops() {
        use crate::engine::testing::{driver_context, engine_with, Behavior, ScriptTurn};

        let script = Arc::new(parking_lot::Mutex::new(vec![
            ScriptTurn {
                error: Some(
                    r#"tool_use_failed | Details: {"message":"bad","failed_generation":"x"}"#
                        .into(),
                ),
                ..Default::default()
            },
            ScriptTurn {
                content: vec!["recovered fine".into()],
                ..Default::default()
            },
        ]));
        let engine = Arc::new(engine_with(
            &[("scripted", Behavior::Script(script))],
            &[("agent", &["p-scripted"])],
        ));
        let ctx = driver_context(Arc::clone(&engine), "agent", "go", None, vec![]).await;

        let chunks: Vec<_> = run_native(ctx)
            .map(|c| c.unwrap())
            .collect::<Vec<_>>()
            .await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.delta().and_then(|d| d.content.clone()))
            .collect();
        assert!(text.contains("recovered fine"));
        assert_eq!(chunks.last().unwrap().finish_reason(), Some("stop"));
    }

    #[test]
    fn recovery_message_extracts_failed_generation() {
        let error = r#"bad request: tool_use_failed | Details: {"message":"bad args","failed_generation":"<tool>x</tool>"}"#;
        let note = recovery_message(error).unwrap();
        let text = note.content.unwrap().as_text();
        assert!(text.contains("validation error: bad args"));
        assert!(text.contains("<tool>x</tool>"));

        assert!(recovery_message("plain 400, nothing recoverable").is_none());
    }
}
