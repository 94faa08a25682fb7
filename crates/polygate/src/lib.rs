//! polygate is a streaming-aware gateway core that fronts heterogeneous LLM
//! provider APIs behind one OpenAI-compatible surface.
//!
//! # Overview
//! Clients address a logical *model alias*; the gateway resolves it to an
//! ordered chain of provider/model profiles, manages pooled provider
//! credentials, and streams results back. It supports:
//!
//! - Chat (unary and streaming), embeddings, speech and transcription
//! - Silent pre-first-byte fallback across a profile chain
//! - Native tool-calling and structured ReAct agent drivers
//! - Remote MCP tool servers with a circuit-breaking registry
//!
//! # Architecture
//! The crate is organized into modules that map onto the dispatch pipeline:
//! `router` resolves aliases, `keys` owns credential pools, `providers`
//! marshals requests onto each provider's wire, and `engine` ties them
//! together with the fallback and retry rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod cache;

/// OpenAI-compatible wire types shared by the HTTP surface and the adapters
pub mod chat;

/// Typed gateway configuration, user overrides and the ReAct pattern registry
pub mod config;

pub mod engine;

/// Error types and handling
pub mod error;

/// Per-provider credential pools with quarantine and retirement
pub mod keys;

pub mod mcp;

pub mod orchestrator;

/// Provider adapters: request marshalling, normalization and stream decoding
pub mod providers;

pub mod rotation;

/// Alias resolution and fallback-chain construction
pub mod router;

pub mod secrets;

pub mod session;

/// In-process native tool registry
pub mod tools;

/// Tool call represents a function call that an LLM wants to make.
/// This is a standardized structure used across all providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// FunctionCall contains details about which function to call and with what arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, serialized as a JSON string.
    pub arguments: String,
}

/// An authenticated caller of the gateway.
///
/// `provider_keys` lets a user bring their own credentials for a provider;
/// those bypass the system pools entirely. `config_overrides` is a sparse
/// tree merged over the global configuration for this user's requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub provider_keys: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_overrides: Option<config::ConfigOverrides>,
}
