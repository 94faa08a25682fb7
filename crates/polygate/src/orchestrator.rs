//! Unified tool dispatch.
//!
//! The orchestrator fronts three tool surfaces with one `call_tool`: native
//! in-process tools, remote MCP tools, and whatever the client declared in
//! its request, since the drivers route by name through here. Tool
//! failures are inlined as `{"error": ...}` values; a tool call never aborts
//! a driver.

use crate::config::GatewayConfig;
use crate::mcp::{McpClient, McpRegistry, ServerHealth};
use crate::tools::NativeToolRegistry;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ToolOrchestrator {
    native: Arc<NativeToolRegistry>,
    registry: Arc<McpRegistry>,
    client: McpClient,
    toggles: HashMap<String, bool>,
}

impl ToolOrchestrator {
    pub fn new(
        native: Arc<NativeToolRegistry>,
        registry: Arc<McpRegistry>,
        http: reqwest::Client,
        config: &GatewayConfig,
        session_id: &str,
    ) -> Self {
        ToolOrchestrator {
            native,
            client: McpClient::new(Arc::clone(&registry), http, session_id),
            registry,
            toggles: config.native_tool_toggles.clone(),
        }
    }

    /// Expands a bare or slightly wrong tool name to a qualified
    /// `server::tool`: no prefix picks the first configured server, and a
    /// `server`/`servers` typo in the prefix is corrected when the corrected
    /// name exists.
    fn qualify(&self, tool_name: &str) -> Option<String> {
        if let Some((server, tool)) = tool_name.split_once("::") {
            let known = self.registry.server_names();
            if known.iter().any(|s| s == server) {
                return Some(tool_name.to_string());
            }
            let singular = server.replace("servers", "server");
            if known.iter().any(|s| *s == singular) {
                return Some(format!("{}::{}", singular, tool));
            }
            let plural = server.replace("server", "servers");
            if known.iter().any(|s| *s == plural) {
                return Some(format!("{}::{}", plural, tool));
            }
            // Unknown server; pass through and let the client error cleanly.
            return Some(tool_name.to_string());
        }
        self.registry
            .default_server()
            .map(|server| format!("{}::{}", server, tool_name))
    }

    /// Dispatches a tool call. The returned value is always usable as a tool
    /// observation; failures come back as `{"error": ...}`.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Value {
        if self.native.contains(tool_name) {
            if !self.toggles.get(tool_name).unwrap_or(&true) {
                return json!({"error": format!("tool {} is disabled by configuration", tool_name)});
            }
            let tool = self.native.get(tool_name).expect("checked contains");
            info!(tool = %tool_name, "executing native tool");
            return match tool.call(arguments).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %tool_name, error = %e, "native tool failed");
                    json!({"error": e.to_string()})
                }
            };
        }

        let Some(full_name) = self.qualify(tool_name) else {
            return json!({"error": "no MCP servers configured"});
        };
        match self.client.call_tool(&full_name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %full_name, error = %e, "remote tool failed");
                json!({"error": e.to_string()})
            }
        }
    }

    /// True when the named tool should trigger the waiting banner.
    pub fn is_long_running(&self, tool_name: &str) -> bool {
        self.native.is_long_running(tool_name)
    }

    /// Tools visible to an agent: active MCP tools (optionally filtered to
    /// the agent's allowed servers) plus enabled native tools.
    pub fn available_tools(&self, allowed_servers: Option<&[String]>) -> Vec<Value> {
        let mut tools: Vec<Value> = self
            .registry
            .active_tools()
            .into_iter()
            .filter(|tool| {
                let Some(allowed) = allowed_servers else { return true };
                let name = tool.get("name").and_then(Value::as_str).unwrap_or("");
                name.split_once("::")
                    .is_some_and(|(server, _)| allowed.iter().any(|a| a == server))
            })
            .collect();

        for descriptor in self.native.enabled_descriptors(&self.toggles) {
            if let Ok(value) = serde_json::to_value(&descriptor) {
                tools.push(value);
            }
        }
        tools
    }

    /// Status block injected into agent prompts. Only ONLINE servers are
    /// reported; "." means nothing to report and suppresses the header.
    pub fn server_status_text(&self) -> String {
        let mut lines = vec!["**CURRENT LIVE MCP SERVER STATUS:**".to_string()];
        let mut names = self.registry.server_names();
        names.sort();
        let mut any_online = false;
        for name in names {
            if self.registry.server_health(&name) == ServerHealth::Online {
                lines.push(format!("- {}: ONLINE", name));
                any_online = true;
            }
        }
        if !any_online {
            return ".".to_string();
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;
    use crate::tools::testing::EchoTool;

    fn orchestrator(servers: &[&str]) -> ToolOrchestrator {
        let mut native = NativeToolRegistry::new();
        native.register(Arc::new(EchoTool {
            name: "echo".into(),
            long_running: false,
        }));
        let registry = McpRegistry::new(
            servers
                .iter()
                .map(|name| McpServerConfig {
                    name: name.to_string(),
                    url: format!("http://mcp/{}", name),
                })
                .collect(),
            reqwest::Client::new(),
            None,
        );
        let config = GatewayConfig::default();
        ToolOrchestrator::new(
            Arc::new(native),
            registry,
            reqwest::Client::new(),
            &config,
            "session-1",
        )
    }

    #[tokio::test]
    async fn native_tools_dispatch_directly() {
        let orch = orchestrator(&[]);
        let out = orch.call_tool("echo", json!({"q": "hi"})).await;
        assert_eq!(out["echo"]["q"], "hi");
    }

    #[tokio::test]
    async fn disabled_native_tool_returns_inline_error() {
        let mut orch = orchestrator(&[]);
        orch.toggles.insert("echo".into(), false);
        let out = orch.call_tool("echo", json!({})).await;
        assert!(out["error"].as_str().unwrap().contains("disabled"));
    }

    #[test]
    fn bare_names_get_the_first_server() {
        let orch = orchestrator(&["alpha", "beta"]);
        assert_eq!(orch.qualify("find").as_deref(), Some("alpha::find"));
    }

    #[test]
    fn pluralization_typos_are_corrected() {
        let orch = orchestrator(&["search-servers"]);
        assert_eq!(
            orch.qualify("search-server::find").as_deref(),
            Some("search-servers::find")
        );
        let orch = orchestrator(&["search-server"]);
        assert_eq!(
            orch.qualify("search-servers::find").as_deref(),
            Some("search-server::find")
        );
    }

    #[test]
    fn no_servers_means_no_qualification() {
        let orch = orchestrator(&[]);
        assert!(orch.qualify("find").is_none());
    }

    #[test]
    fn status_text_is_dot_when_everything_offline() {
        let orch = orchestrator(&["alpha"]);
        assert_eq!(orch.server_status_text(), ".");
    }

    #[test]
    fn available_tools_include_native_descriptors() {
        let orch = orchestrator(&[]);
        let tools = orch.available_tools(None);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], "echo");
    }
}
