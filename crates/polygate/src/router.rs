//! Alias resolution and fallback-chain construction.
//!
//! An alias resolves to an ordered chain of profile names. When the alias
//! carries `main_length` metadata, the first `main_length` entries form a
//! load-balanced pool: the rotation index picks exactly one of them for this
//! request, and the remaining entries stay as strict fallbacks. The main
//! pool spreads load across requests; it is not intra-request redundancy.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::rotation::RotationIndex;
use serde::Serialize;
use tracing::{error, info};

/// Builds the effective chain for one request.
pub async fn resolve_chain(
    config: &GatewayConfig,
    rotation: &RotationIndex,
    alias: &str,
) -> Result<Vec<String>, GatewayError> {
    let chain = config
        .router_settings
        .model_group_alias
        .get(alias)
        .ok_or_else(|| GatewayError::AliasNotFound(alias.to_string()))?;

    let metadata = config.router_settings.agent_metadata.get(alias);
    let Some(meta) = metadata.filter(|m| m.main_length > 1 && m.main_length <= chain.len()) else {
        return Ok(chain.clone());
    };

    let main_pool = &chain[..meta.main_length];
    let fallbacks = &chain[meta.main_length..];
    let index = rotation.get_and_advance(alias, meta.main_length).await;

    let head = if index < main_pool.len() {
        main_pool[index].clone()
    } else {
        error!(
            alias = %alias,
            index,
            pool_size = main_pool.len(),
            "rotation index out of bounds, using slot 0"
        );
        main_pool[0].clone()
    };

    let mut effective = Vec::with_capacity(1 + fallbacks.len());
    effective.push(head);
    effective.extend(fallbacks.iter().cloned());
    info!(alias = %alias, head = %effective[0], "load-balanced chain head selected");
    Ok(effective)
}

/// A client-visible alias plus its agent flag, for `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct RunnableModel {
    pub id: String,
    pub name: String,
    pub is_agent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_mode: Option<String>,
}

/// Lists every configured alias, marking those whose head profile declares a
/// reasoning mode.
pub fn runnable_models(config: &GatewayConfig) -> Vec<RunnableModel> {
    let mut models: Vec<RunnableModel> = config
        .router_settings
        .model_group_alias
        .iter()
        .filter_map(|(alias, chain)| {
            let head = chain.first()?;
            let reasoning_mode = config
                .profile(head)
                .and_then(|p| p.model_params.agent_settings.as_ref())
                .and_then(|a| a.reasoning_mode.clone());
            Some(RunnableModel {
                id: alias.clone(),
                name: alias.clone(),
                is_agent: reasoning_mode.is_some(),
                reasoning_mode,
            })
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSettings, AliasMetadata, ModelParams, ModelProfile};
    use std::collections::HashMap;

    fn config_with_chain(alias: &str, chain: &[&str], main_length: usize) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config
            .router_settings
            .model_group_alias
            .insert(alias.to_string(), chain.iter().map(|s| s.to_string()).collect());
        if main_length > 0 {
            config
                .router_settings
                .agent_metadata
                .insert(alias.to_string(), AliasMetadata { main_length });
        }
        config
    }

    #[tokio::test]
    async fn unknown_alias_is_terminal() {
        let config = GatewayConfig::default();
        let rotation = RotationIndex::new(None);
        let err = resolve_chain(&config, &rotation, "nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::AliasNotFound(_)));
    }

    #[tokio::test]
    async fn plain_alias_returns_full_chain() {
        let config = config_with_chain("fast", &["p1", "p2", "p3"], 0);
        let rotation = RotationIndex::new(None);
        let chain = resolve_chain(&config, &rotation, "fast").await.unwrap();
        assert_eq!(chain, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn main_pool_picks_one_head_and_keeps_fallbacks() {
        // main = [A, B, C], fallbacks = [D]; every request gets [head, D].
        let config = config_with_chain("agent", &["A", "B", "C", "D"], 3);
        let rotation = RotationIndex::new(None);

        let mut head_counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let chain = resolve_chain(&config, &rotation, "agent").await.unwrap();
            assert_eq!(chain.len(), 2);
            assert_eq!(chain[1], "D");
            *head_counts.entry(chain[0].clone()).or_default() += 1;
        }
        assert_eq!(head_counts["A"], 10);
        assert_eq!(head_counts["B"], 10);
        assert_eq!(head_counts["C"], 10);
    }

    #[tokio::test]
    async fn main_length_larger_than_chain_is_ignored() {
        let config = config_with_chain("x", &["p1", "p2"], 5);
        let rotation = RotationIndex::new(None);
        let chain = resolve_chain(&config, &rotation, "x").await.unwrap();
        assert_eq!(chain, vec!["p1", "p2"]);
    }

    #[test]
    fn runnable_models_flag_agents() {
        let mut config = config_with_chain("coding_agent", &["p1"], 0);
        config
            .router_settings
            .model_group_alias
            .insert("plain".into(), vec!["p2".into()]);
        config.model_list.push(ModelProfile {
            model_name: "p1".into(),
            provider: "groq".into(),
            model_params: ModelParams {
                agent_settings: Some(AgentSettings {
                    reasoning_mode: Some("native_tool_calling".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        });
        config.model_list.push(ModelProfile {
            model_name: "p2".into(),
            provider: "groq".into(),
            model_params: ModelParams::default(),
        });

        let models = runnable_models(&config);
        assert_eq!(models.len(), 2);
        let agent = models.iter().find(|m| m.id == "coding_agent").unwrap();
        assert!(agent.is_agent);
        assert_eq!(agent.reasoning_mode.as_deref(), Some("native_tool_calling"));
        assert!(!models.iter().find(|m| m.id == "plain").unwrap().is_agent);
    }
}
