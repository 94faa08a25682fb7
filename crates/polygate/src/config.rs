//! Typed gateway configuration.
//!
//! The whole configuration is one TOML document deserialized at startup.
//! Reads are lock-free: the active config lives behind an [`ArcSwap`] and
//! hot reload replaces the top-level reference atomically. Per-user
//! overrides are sparse, well-typed records merged over the global config.

use crate::error::GatewayError;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A concrete (provider, model, parameters) triple. Created at configuration
/// load, immutable at runtime, referenced by name only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_name: String,
    pub provider: String,
    #[serde(default)]
    pub model_params: ModelParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    /// Provider-side model id, or a model-alias rotated by the rotation index.
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_settings: Option<AgentSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Declared reasoning mode; any value other than `native_tool_calling`
    /// names a ReAct pattern from the pattern registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tool_servers: Option<Vec<String>>,
}

/// Alias metadata: the first `main_length` chain entries form a
/// load-balanced pool, the remainder are strict fallbacks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AliasMetadata {
    pub main_length: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSettings {
    /// alias -> ordered profile-name chain; position 0 is preferred.
    #[serde(default)]
    pub model_group_alias: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub agent_metadata: HashMap<String, AliasMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRule {
    /// Profile names this rule applies to; `*` matches everything.
    #[serde(default)]
    pub model_names: Vec<String>,
    /// Request fields hashed into the fingerprint.
    #[serde(default)]
    pub include_in_key: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub rules: Vec<CacheRule>,
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_prefix() -> String {
    "polygate:cache:".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: false,
            ttl_seconds: default_cache_ttl(),
            key_prefix: default_cache_prefix(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
}

/// One step of the scripted waiting banner for long-running tools.
/// `delay_secs` is relative to the previous step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingMessage {
    #[serde(default)]
    pub delay_secs: u64,
    pub message: String,
}

/// Native-reasoning parameters injected for specific concrete models, plus
/// the stream-parser mode their output requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningModelConfig {
    pub provider: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// `delta_reasoning_field` maps a provider's `reasoning` delta field onto
    /// `reasoning_content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_handling: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub model_list: Vec<ModelProfile>,
    #[serde(default)]
    pub router_settings: RouterSettings,
    #[serde(default)]
    pub cache_settings: CacheSettings,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Per-tool enable switches for the native registry; absent means enabled.
    #[serde(default)]
    pub native_tool_toggles: HashMap<String, bool>,
    /// provider -> model alias -> concrete model variants, rotated round-robin.
    #[serde(default)]
    pub model_aliases: HashMap<String, HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub reasoning_models: HashMap<String, ReasoningModelConfig>,
    #[serde(default)]
    pub waiting_messages: Vec<WaitingMessage>,
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tools_file: Option<PathBuf>,
    #[serde(default = "default_gemini_cache_min_chars")]
    pub gemini_cache_min_chars: usize,
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys_pool")
}

fn default_gemini_cache_min_chars() -> usize {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            model_list: Vec::new(),
            router_settings: RouterSettings::default(),
            cache_settings: CacheSettings::default(),
            mcp_servers: Vec::new(),
            native_tool_toggles: HashMap::new(),
            model_aliases: HashMap::new(),
            reasoning_models: HashMap::new(),
            waiting_messages: Vec::new(),
            keys_dir: default_keys_dir(),
            patterns_dir: None,
            mcp_tools_file: None,
            gemini_cache_min_chars: default_gemini_cache_min_chars(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("invalid config '{}': {}", path.display(), e)))
    }

    /// Looks up a model profile by its internal name.
    pub fn profile(&self, name: &str) -> Option<&ModelProfile> {
        self.model_list.iter().find(|p| p.model_name == name)
    }

    /// Applies a user's sparse overrides, returning the effective config.
    pub fn merged_with(&self, overrides: &ConfigOverrides) -> GatewayConfig {
        let mut merged = self.clone();
        if let Some(aliases) = &overrides.model_group_alias {
            for (alias, chain) in aliases {
                merged
                    .router_settings
                    .model_group_alias
                    .insert(alias.clone(), chain.clone());
            }
        }
        if let Some(toggles) = &overrides.native_tool_toggles {
            for (tool, enabled) in toggles {
                merged.native_tool_toggles.insert(tool.clone(), *enabled);
            }
        }
        if let Some(cache) = &overrides.cache_settings {
            if let Some(enabled) = cache.enabled {
                merged.cache_settings.enabled = enabled;
            }
            if let Some(ttl) = cache.ttl_seconds {
                merged.cache_settings.ttl_seconds = ttl;
            }
        }
        merged
    }
}

/// Sparse per-user override tree. Absent fields inherit the global value;
/// maps merge key-by-key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_group_alias: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_tool_toggles: Option<HashMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_settings: Option<CacheSettingsOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettingsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// The active configuration. `load()` is lock-free; `store()` swaps the
/// whole tree atomically (hot reload).
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<GatewayConfig>>,
}

impl SharedConfig {
    pub fn new(config: GatewayConfig) -> Self {
        SharedConfig {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<GatewayConfig> {
        self.inner.load_full()
    }

    pub fn store(&self, config: GatewayConfig) {
        self.inner.store(Arc::new(config));
        info!("gateway configuration replaced");
    }

    /// Effective config for a request: global, or global + user overrides.
    pub fn for_user(&self, user: Option<&crate::User>) -> Arc<GatewayConfig> {
        match user.and_then(|u| u.config_overrides.as_ref()) {
            Some(overrides) => Arc::new(self.load().merged_with(overrides)),
            None => self.load(),
        }
    }
}

/// A declarative ReAct pattern: a static system preamble (cacheable by the
/// provider) and a dynamic context block rendered per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactPattern {
    pub name: String,
    pub static_system: String,
    pub dynamic_context: String,
}

/// Scans a directory for `*.toml` pattern records. No code is executed at
/// load time; a file that fails to parse is skipped with a warning.
pub fn load_patterns(dir: &Path) -> HashMap<String, ReactPattern> {
    let mut patterns = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read pattern directory");
            return patterns;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "toml") {
            continue;
        }
        match std::fs::read_to_string(&path).map_err(|e| e.to_string()).and_then(|raw| {
            toml::from_str::<ReactPattern>(&raw).map_err(|e| e.to_string())
        }) {
            Ok(pattern) => {
                info!(pattern = %pattern.name, file = %path.display(), "loaded reasoning pattern");
                patterns.insert(pattern.name.clone(), pattern);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "skipping invalid pattern file"),
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [[model_list]]
            model_name = "groq-llama"
            provider = "groq"
            model_params = { model = "llama-3.3-70b-versatile" }

            [router_settings.model_group_alias]
            fast = ["groq-llama"]

            [cache_settings]
            enabled = true
            ttl_seconds = 60
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.model_list.len(), 1);
        assert_eq!(
            config.router_settings.model_group_alias.get("fast").unwrap(),
            &vec!["groq-llama".to_string()]
        );
        assert!(config.cache_settings.enabled);
        assert_eq!(config.cache_settings.ttl_seconds, 60);
        assert!(config.profile("groq-llama").is_some());
        assert!(config.profile("nope").is_none());
    }

    #[test]
    fn overrides_merge_sparsely() {
        let mut config = GatewayConfig::default();
        config
            .router_settings
            .model_group_alias
            .insert("a".into(), vec!["p1".into()]);
        config.cache_settings.enabled = true;
        config.cache_settings.ttl_seconds = 100;

        let overrides = ConfigOverrides {
            model_group_alias: Some(HashMap::from([("b".into(), vec!["p2".into()])])),
            cache_settings: Some(CacheSettingsOverride {
                ttl_seconds: Some(5),
                enabled: None,
            }),
            ..Default::default()
        };

        let merged = config.merged_with(&overrides);
        assert_eq!(merged.router_settings.model_group_alias.len(), 2);
        assert!(merged.cache_settings.enabled, "untouched field inherited");
        assert_eq!(merged.cache_settings.ttl_seconds, 5);
    }

    #[test]
    fn pattern_scan_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut good = std::fs::File::create(dir.path().join("linear.toml")).unwrap();
        writeln!(
            good,
            "name = \"linear\"\nstatic_system = \"sys\"\ndynamic_context = \"ctx\""
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let patterns = load_patterns(dir.path());
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns.get("linear").unwrap().static_system, "sys");
    }

    #[test]
    fn shared_config_hot_swap_is_visible() {
        let shared = SharedConfig::new(GatewayConfig::default());
        assert!(!shared.load().cache_settings.enabled);
        let mut next = GatewayConfig::default();
        next.cache_settings.enabled = true;
        shared.store(next);
        assert!(shared.load().cache_settings.enabled);
    }
}
