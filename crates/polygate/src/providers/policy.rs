//! Request policy for OpenAI-compatible wires.
//!
//! A [`RequestPolicy`] is resolved *before* wire-formatting and describes
//! what the outgoing payload may contain: whether tools survive, whether
//! native reasoning parameters are injected or suppressed, and which
//! parameters are stripped outright. `normalized()` enforces the structural
//! invariant `tools_enabled = false ⇒ tool_choice = None ∧
//! ¬parallel_tool_calls_enabled`.

use crate::chat::{ChatCompletionRequest, Tool};
use crate::config::{ModelProfile, ReasoningModelConfig};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

/// Models that reject `parallel_tool_calls`.
const NO_PARALLEL_TOOLS_MODELS: &[&str] = &[
    "openai/gpt-oss-20b",
    "openai/gpt-oss-120b",
    "openai/gpt-oss-safeguard-20b",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningStrategy {
    /// Inject provider-native reasoning parameters when configured.
    Native,
    /// Strictly suppress native reasoning (ReAct drives via text).
    Suppress,
}

/// How the stream parser must treat the provider's reasoning output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHandling {
    /// The provider puts reasoning in a `reasoning` delta field.
    DeltaReasoningField,
}

#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub tools_enabled: bool,
    /// `None` strips the parameter entirely.
    pub tool_choice: Option<String>,
    pub parallel_tool_calls_enabled: bool,
    pub reasoning_strategy: ReasoningStrategy,
    /// Explicit response-format override (e.g. `{"type":"text"}` for ReAct).
    pub response_format: Option<Value>,
    /// Parameters removed from the payload no matter what the request said.
    pub strip_forbidden_params: Vec<String>,
    /// Whether suppression may force `{"type":"text"}`.
    pub allow_text_fallback: bool,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        RequestPolicy {
            tools_enabled: true,
            tool_choice: Some("auto".to_string()),
            parallel_tool_calls_enabled: true,
            reasoning_strategy: ReasoningStrategy::Native,
            response_format: None,
            strip_forbidden_params: Vec::new(),
            allow_text_fallback: true,
        }
    }
}

impl RequestPolicy {
    /// Enforces internal consistency after construction.
    pub fn normalized(mut self) -> Self {
        if !self.tools_enabled {
            self.tool_choice = None;
            self.parallel_tool_calls_enabled = false;
        }
        if self.reasoning_strategy == ReasoningStrategy::Suppress && self.allow_text_fallback {
            let is_json_mode = self
                .response_format
                .as_ref()
                .and_then(|f| f.get("type"))
                .and_then(Value::as_str)
                == Some("json_object");
            if self.response_format.is_none() || is_json_mode {
                self.response_format = Some(json!({"type": "text"}));
            }
        }
        self
    }
}

/// Translates a profile and the request's declared tools into a policy.
pub fn resolve_policy(
    profile: &ModelProfile,
    real_model: &str,
    payload_tools: Option<&[Tool]>,
) -> RequestPolicy {
    let reasoning_mode = profile
        .model_params
        .agent_settings
        .as_ref()
        .and_then(|a| a.reasoning_mode.as_deref());
    let is_react_active = reasoning_mode.is_some_and(|m| m != "native_tool_calling");

    let has_tools = payload_tools.is_some_and(|tools| !tools.is_empty());

    let mut forbidden = Vec::new();
    let mut parallel_enabled = true;
    if NO_PARALLEL_TOOLS_MODELS.iter().any(|m| real_model.contains(m)) {
        parallel_enabled = false;
        forbidden.push("parallel_tool_calls".to_string());
        debug!(model = %real_model, "parallel tool calls disabled for this model");
    }

    // Some providers 400 on sampling params or response_format alongside
    // reasoning models; sambanova is the known offender.
    let mut force_clean_format = false;
    let mut has_tools = has_tools;
    if profile.provider == "sambanova" {
        let model = real_model.to_lowercase();
        if model.contains("deepseek") && model.contains("distill-llama-70b") {
            info!(model = %real_model, "sanitizing sambanova distill payload: no tools, no format");
            has_tools = false;
        } else {
            info!(model = %real_model, "sanitizing sambanova payload: no format");
        }
        forbidden.extend(["stop", "temperature", "top_p"].map(String::from));
        force_clean_format = true;
    }

    RequestPolicy {
        tools_enabled: has_tools,
        tool_choice: has_tools.then(|| "auto".to_string()),
        parallel_tool_calls_enabled: parallel_enabled && has_tools,
        reasoning_strategy: if is_react_active {
            ReasoningStrategy::Suppress
        } else {
            ReasoningStrategy::Native
        },
        strip_forbidden_params: forbidden,
        allow_text_fallback: !force_clean_format,
        response_format: if force_clean_format {
            None
        } else if is_react_active {
            Some(json!({"type": "text"}))
        } else {
            None
        },
    }
    .normalized()
}

/// Applies a policy to the request, producing the provider payload plus the
/// stream-parser mode when native reasoning parameters were injected.
pub fn compose_payload(
    req: &ChatCompletionRequest,
    policy: &RequestPolicy,
    real_model: &str,
    provider: &str,
    reasoning: Option<&ReasoningModelConfig>,
) -> (Map<String, Value>, Option<OutputHandling>) {
    let mut payload = match serde_json::to_value(req) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    // Drop nulls so absent options never reach the wire.
    payload.retain(|_, v| !v.is_null());

    if !policy.tools_enabled {
        payload.remove("tools");
    }
    match &policy.tool_choice {
        None => {
            payload.remove("tool_choice");
        }
        Some(choice) if choice != "auto" => {
            payload.insert("tool_choice".to_string(), Value::String(choice.clone()));
        }
        Some(_) => {}
    }
    if !policy.parallel_tool_calls_enabled {
        payload.remove("parallel_tool_calls");
    }

    if let Some(format) = &policy.response_format {
        payload.insert("response_format".to_string(), format.clone());
    }

    for param in &policy.strip_forbidden_params {
        payload.remove(param.as_str());
    }

    let mut output_handling = None;
    match policy.reasoning_strategy {
        ReasoningStrategy::Suppress => {
            debug!(provider = %provider, "native reasoning suppressed by policy");
        }
        ReasoningStrategy::Native => {
            let applicable = reasoning.filter(|cfg| cfg.provider == provider);
            if let Some(cfg) = applicable {
                // Groq rejects reasoning parameters combined with tools or
                // JSON mode.
                let has_tools_in_payload = payload.contains_key("tools");
                let is_json = payload
                    .get("response_format")
                    .and_then(|f| f.get("type"))
                    .and_then(Value::as_str)
                    == Some("json_object");
                if provider == "groq" && (has_tools_in_payload || is_json) {
                    warn!(
                        provider = %provider,
                        tools = has_tools_in_payload,
                        json = is_json,
                        "reasoning suppressed by provider constraints"
                    );
                } else {
                    for (k, v) in &cfg.params {
                        payload.insert(k.clone(), v.clone());
                    }
                    if cfg.output_handling.as_deref() == Some("delta_reasoning_field") {
                        output_handling = Some(OutputHandling::DeltaReasoningField);
                    }
                    info!(provider = %provider, model = %real_model, "native reasoning enabled");
                }
            }
        }
    }

    payload.insert("model".to_string(), Value::String(real_model.to_string()));
    (payload, output_handling)
}
