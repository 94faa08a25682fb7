//! MCP (Model Context Protocol) plumbing.
//!
//! Two layers: [`McpRegistry`] is the shared circuit breaker: it probes
//! servers, caches their qualified tool lists, and intersects server health
//! with the per-tool `enabled` flags persisted in a JSON config file that is
//! hot-reloaded on mtime change. [`McpClient`] is the per-request caller:
//! JSON-RPC 2.0 over HTTP POST with `Mcp-Session-Id` and
//! `Mcp-Protocol-Version` headers. A network failure during a call trips the
//! breaker: the server goes OFFLINE and its cached tool list is dropped
//! until the next refresh re-probes it.

use crate::config::McpServerConfig;
use crate::error::GatewayError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

const READ_TIMEOUT: Duration = Duration::from_secs(60);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the tools-file mtime poll.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolSettings {
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

/// On-disk shape of the per-tool settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpToolsFile {
    /// server name -> short tool name -> settings
    #[serde(default)]
    pub tools: HashMap<String, HashMap<String, McpToolSettings>>,
}

#[derive(Default)]
struct RegistryState {
    health: HashMap<String, ServerHealth>,
    /// Qualified (`server::tool`) descriptor lists per ONLINE server.
    tool_lists: HashMap<String, Vec<Value>>,
    settings: McpToolsFile,
    last_mtime: Option<SystemTime>,
}

pub struct McpRegistry {
    servers: HashMap<String, McpServerConfig>,
    http: reqwest::Client,
    config_path: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl McpRegistry {
    pub fn new(
        servers: Vec<McpServerConfig>,
        http: reqwest::Client,
        config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let registry = McpRegistry {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            http,
            config_path,
            state: RwLock::new(RegistryState::default()),
        };
        registry.load_settings();
        Arc::new(registry)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn server_url(&self, name: &str) -> Option<String> {
        self.servers.get(name).map(|s| s.url.clone())
    }

    /// First configured server, the fuzzy-routing default.
    pub fn default_server(&self) -> Option<String> {
        // HashMap order is arbitrary; prefer a stable pick.
        let mut names = self.server_names();
        names.sort();
        names.into_iter().next()
    }

    pub fn server_health(&self, name: &str) -> ServerHealth {
        *self
            .state
            .read()
            .health
            .get(name)
            .unwrap_or(&ServerHealth::Offline)
    }

    pub fn online_servers(&self) -> Vec<McpServerConfig> {
        let state = self.state.read();
        self.servers
            .values()
            .filter(|s| state.health.get(&s.name) == Some(&ServerHealth::Online))
            .cloned()
            .collect()
    }

    /// Trips the breaker for a server: OFFLINE plus cached tool list dropped.
    pub fn report_failure(&self, name: &str, error: &str) {
        warn!(server = %name, error = %error, "mcp server marked offline");
        let mut state = self.state.write();
        state.health.insert(name.to_string(), ServerHealth::Offline);
        state.tool_lists.remove(name);
    }

    /// ONLINE ∩ enabled: the tool descriptors agents may see.
    pub fn active_tools(&self) -> Vec<Value> {
        let state = self.state.read();
        let mut tools = Vec::new();
        for (server, list) in &state.tool_lists {
            if state.health.get(server) != Some(&ServerHealth::Online) {
                continue;
            }
            let server_settings = state.settings.tools.get(server);
            for tool in list {
                let full_name = tool.get("name").and_then(Value::as_str).unwrap_or("");
                let short_name = full_name.split_once("::").map(|(_, t)| t).unwrap_or(full_name);
                let enabled = server_settings
                    .and_then(|s| s.get(short_name))
                    .map(|s| s.enabled)
                    .unwrap_or(true);
                if enabled {
                    tools.push(tool.clone());
                }
            }
        }
        tools
    }

    /// Probes every configured server: `initialize` then `tools/list`,
    /// qualifying names as `server::tool`. Newly discovered tools are added
    /// to the settings file (enabled) without touching existing toggles.
    pub async fn refresh(&self) {
        info!("starting mcp registry refresh");
        self.reload_settings_if_changed();

        let mut settings_changed = false;
        for (name, config) in &self.servers {
            match self.fetch_tools(name, &config.url).await {
                Ok(tools) => {
                    {
                        let mut state = self.state.write();
                        let server_settings =
                            state.settings.tools.entry(name.clone()).or_default();
                        for tool in &tools {
                            let full_name =
                                tool.get("name").and_then(Value::as_str).unwrap_or("");
                            let short_name = full_name
                                .split_once("::")
                                .map(|(_, t)| t)
                                .unwrap_or(full_name);
                            if !server_settings.contains_key(short_name) {
                                server_settings.insert(
                                    short_name.to_string(),
                                    McpToolSettings {
                                        enabled: true,
                                        description: tool
                                            .get("description")
                                            .and_then(Value::as_str)
                                            .unwrap_or("")
                                            .to_string(),
                                    },
                                );
                                settings_changed = true;
                                info!(tool = %full_name, "added new mcp tool to config");
                            }
                        }
                        state.health.insert(name.clone(), ServerHealth::Online);
                        state.tool_lists.insert(name.clone(), tools);
                    }
                    info!(server = %name, "mcp server online");
                }
                Err(e) => {
                    self.report_failure(name, &e.to_string());
                }
            }
        }
        if settings_changed {
            self.save_settings();
        }
        info!("mcp registry refresh complete");
    }

    async fn fetch_tools(&self, server_name: &str, url: &str) -> Result<Vec<Value>, GatewayError> {
        let headers_session = format!("discovery-{}", Uuid::new_v4());

        // Initialize is best-effort: many HTTP MCP servers are stateless.
        let _ = self
            .http
            .post(url)
            .timeout(DISCOVERY_TIMEOUT)
            .header("Mcp-Protocol-Version", MCP_PROTOCOL_VERSION)
            .header("Mcp-Session-Id", &headers_session)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "initialize",
                "id": "init",
                "params": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "polygate", "version": env!("CARGO_PKG_VERSION")},
                },
            }))
            .send()
            .await;

        let resp = self
            .http
            .post(url)
            .timeout(DISCOVERY_TIMEOUT)
            .header("Mcp-Protocol-Version", MCP_PROTOCOL_VERSION)
            .header("Mcp-Session-Id", &headers_session)
            .json(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": "tools"}))
            .send()
            .await?
            .error_for_status()
            .map_err(GatewayError::from)?;

        let body: Value = resp.json().await?;
        let mut tools = body
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tool in &mut tools {
            if let Some(name) = tool.get("name").and_then(Value::as_str) {
                tool["name"] = Value::String(format!("{}::{}", server_name, name));
            }
        }
        Ok(tools)
    }

    // --- Settings file ---

    fn load_settings(&self) {
        let Some(path) = &self.config_path else { return };
        if !path.exists() {
            self.save_settings();
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => {}
            Ok(raw) => match serde_json::from_str::<McpToolsFile>(&raw) {
                Ok(settings) => {
                    let mut state = self.state.write();
                    state.settings = settings;
                    state.last_mtime = file_mtime(path);
                    info!(file = %path.display(), "loaded mcp tool settings");
                }
                Err(e) => error!(file = %path.display(), error = %e, "invalid mcp tool settings"),
            },
            Err(e) => error!(file = %path.display(), error = %e, "cannot read mcp tool settings"),
        }
    }

    fn save_settings(&self) {
        let Some(path) = &self.config_path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let serialized = {
            let state = self.state.read();
            serde_json::to_string_pretty(&state.settings)
        };
        match serialized {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(path, serialized) {
                    error!(file = %path.display(), error = %e, "cannot save mcp tool settings");
                    return;
                }
                self.state.write().last_mtime = file_mtime(path);
            }
            Err(e) => error!(error = %e, "cannot serialize mcp tool settings"),
        }
    }

    /// Reloads the settings file when its mtime moved forward.
    pub fn reload_settings_if_changed(&self) {
        let Some(path) = &self.config_path else { return };
        let current = file_mtime(path);
        let known = self.state.read().last_mtime;
        if current.is_some() && current != known {
            info!(file = %path.display(), "mcp tool settings changed on disk, reloading");
            self.load_settings();
        }
    }

    /// Spawns the 2 s mtime watcher.
    pub fn spawn_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reload_settings_if_changed();
            }
        })
    }

    /// Overwrites a tool's enabled flag and persists (admin surface).
    pub fn set_tool_enabled(&self, server: &str, tool: &str, enabled: bool) {
        {
            let mut state = self.state.write();
            state
                .settings
                .tools
                .entry(server.to_string())
                .or_default()
                .entry(tool.to_string())
                .and_modify(|s| s.enabled = enabled)
                .or_insert(McpToolSettings {
                    enabled,
                    description: String::new(),
                });
        }
        self.save_settings();
    }

    #[cfg(test)]
    fn set_online_with_tools(&self, server: &str, tools: Vec<Value>) {
        let mut state = self.state.write();
        state.health.insert(server.to_string(), ServerHealth::Online);
        state.tool_lists.insert(server.to_string(), tools);
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Per-request MCP caller bound to one gateway session.
pub struct McpClient {
    registry: Arc<McpRegistry>,
    http: reqwest::Client,
    mcp_session_id: String,
}

impl McpClient {
    pub fn new(registry: Arc<McpRegistry>, http: reqwest::Client, user_session_id: &str) -> Self {
        McpClient {
            registry,
            http,
            mcp_session_id: format!(
                "mcp-session-{}-{}",
                user_session_id,
                Uuid::new_v4().simple()
            ),
        }
    }

    /// Calls `server::tool`. Network failures trip the registry breaker for
    /// that server before surfacing as `ToolError`.
    pub async fn call_tool(
        &self,
        full_tool_name: &str,
        arguments: Value,
    ) -> Result<Value, GatewayError> {
        let (server_name, tool_name) = full_tool_name.split_once("::").ok_or_else(|| {
            GatewayError::ToolError(format!("invalid tool name format: {}", full_tool_name))
        })?;
        let url = self.registry.server_url(server_name).ok_or_else(|| {
            GatewayError::ToolError(format!("MCP server '{}' is not configured", server_name))
        })?;

        let payload = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "id": format!("call-{}", Uuid::new_v4()),
            "params": {"name": tool_name, "arguments": arguments},
        });

        info!(tool = %full_tool_name, "calling mcp tool");
        // Connect timeout is short on the shared client; the read timeout is
        // generous because tools can legitimately run for a while.
        let result = self
            .http
            .post(&url)
            .timeout(READ_TIMEOUT)
            .header("Mcp-Protocol-Version", MCP_PROTOCOL_VERSION)
            .header("Mcp-Session-Id", &self.mcp_session_id)
            .json(&payload)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.registry.report_failure(server_name, &e.to_string());
                return Err(GatewayError::ToolError(format!(
                    "MCP server '{}' is unavailable and has been marked offline",
                    server_name
                )));
            }
        };
        let resp = resp.error_for_status().map_err(GatewayError::from)?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            warn!(tool = %full_tool_name, "tool returned an empty response");
            return Ok(json!({"error": format!("tool '{}' returned an empty response", full_tool_name)}));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ParseError(format!("invalid tool reply: {}", e)))?;

        if let Some(error) = body.get("error") {
            return Ok(json!({"error": error.clone()}));
        }

        debug!(tool = %full_tool_name, "mcp tool returned");
        // Flatten text content parts into a single output field for agents.
        if let Some(content) = body.pointer("/result/content").and_then(Value::as_array) {
            let text_parts: Vec<&str> = content
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if !text_parts.is_empty() {
                return Ok(json!({"result": {"output": text_parts.join("\n")}}));
            }
        }
        Ok(json!({"result": body.get("result").cloned().unwrap_or(json!({}))}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(servers: &[(&str, &str)], config_path: Option<PathBuf>) -> Arc<McpRegistry> {
        McpRegistry::new(
            servers
                .iter()
                .map(|(name, url)| McpServerConfig {
                    name: name.to_string(),
                    url: url.to_string(),
                })
                .collect(),
            reqwest::Client::new(),
            config_path,
        )
    }

    fn tool(full_name: &str) -> Value {
        json!({"name": full_name, "description": "d", "inputSchema": {"type": "object"}})
    }

    #[test]
    fn failure_trips_breaker_and_drops_tools() {
        let registry = registry_with(&[("search", "http://mcp/search")], None);
        registry.set_online_with_tools("search", vec![tool("search::find")]);
        assert_eq!(registry.server_health("search"), ServerHealth::Online);
        assert_eq!(registry.active_tools().len(), 1);

        registry.report_failure("search", "connection refused");
        assert_eq!(registry.server_health("search"), ServerHealth::Offline);
        assert!(registry.active_tools().is_empty());
    }

    #[test]
    fn active_tools_respects_enabled_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tools.json");
        let registry = registry_with(&[("srv", "http://mcp/srv")], Some(path));
        registry.set_online_with_tools("srv", vec![tool("srv::a"), tool("srv::b")]);
        assert_eq!(registry.active_tools().len(), 2);

        registry.set_tool_enabled("srv", "b", false);
        let names: Vec<String> = registry
            .active_tools()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["srv::a"]);
    }

    #[test]
    fn settings_survive_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tools.json");
        {
            let registry = registry_with(&[("srv", "http://mcp/srv")], Some(path.clone()));
            registry.set_tool_enabled("srv", "a", false);
        }
        let registry = registry_with(&[("srv", "http://mcp/srv")], Some(path));
        registry.set_online_with_tools("srv", vec![tool("srv::a")]);
        assert!(registry.active_tools().is_empty(), "disabled flag persisted");
    }

    #[test]
    fn external_edit_is_picked_up_by_mtime_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tools.json");
        let registry = registry_with(&[("srv", "http://mcp/srv")], Some(path.clone()));
        registry.set_online_with_tools("srv", vec![tool("srv::a")]);
        assert_eq!(registry.active_tools().len(), 1);

        let external = McpToolsFile {
            tools: HashMap::from([(
                "srv".to_string(),
                HashMap::from([(
                    "a".to_string(),
                    McpToolSettings {
                        enabled: false,
                        description: String::new(),
                    },
                )]),
            )]),
        };
        // The external write moves the file's mtime past the recorded one.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, serde_json::to_string(&external).unwrap()).unwrap();

        registry.reload_settings_if_changed();
        assert!(registry.active_tools().is_empty());
    }

    #[test]
    fn default_server_is_stable(){
        let registry = registry_with(&[("zeta", "http://z"), ("alpha", "http://a")], None);
        assert_eq!(registry.default_server().as_deref(), Some("alpha"));
    }
}
