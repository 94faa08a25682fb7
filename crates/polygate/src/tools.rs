//! In-process native tools.
//!
//! Native tools are trait objects registered at startup; the orchestrator
//! dispatches to them directly, without the MCP wire. A tool may declare
//! itself long-running, which makes the native driver drip scripted waiting
//! messages to the client while a batch containing it executes.

use crate::chat::{FunctionTool, Tool};
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Host-side implementation of one native tool.
#[async_trait]
pub trait NativeTool: Send + Sync {
    /// The function declaration shown to the model.
    fn descriptor(&self) -> Tool;

    /// Long-running tools trigger the waiting-message banner.
    fn long_running(&self) -> bool {
        false
    }

    async fn call(&self, args: Value) -> Result<Value, GatewayError>;
}

#[derive(Default)]
pub struct NativeToolRegistry {
    tools: HashMap<String, Arc<dyn NativeTool>>,
}

impl NativeToolRegistry {
    pub fn new() -> Self {
        NativeToolRegistry::default()
    }

    pub fn register(&mut self, tool: Arc<dyn NativeTool>) {
        self.tools.insert(tool.descriptor().function.name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeTool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_long_running(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.long_running())
    }

    /// Descriptors of every tool that is not switched off in config.
    pub fn enabled_descriptors(&self, toggles: &HashMap<String, bool>) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .tools
            .values()
            .map(|t| t.descriptor())
            .filter(|t| *toggles.get(&t.function.name).unwrap_or(&true))
            .collect();
        tools.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        tools
    }
}

/// Convenience constructor for function descriptors.
pub fn function_descriptor(name: &str, description: &str, parameters: Value) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: FunctionTool {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}
