use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::traits::ToolInvoker;
use conflux_core::types::{ToolCallContext, ToolOutcome, ToolSpec};

#[derive(Default)]
struct Registry {
    servers: HashMap<String, Vec<(ToolSpec, ToolOutcome)>>,
    invocations: Vec<(String, String, serde_json::Value)>,
}

/// Tool invoker with canned outcomes that records every invocation.
#[derive(Clone, Default)]
pub struct RecordingToolInvoker {
    registry: Arc<Mutex<Registry>>,
}

impl RecordingToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(self, server: &str, spec: ToolSpec, outcome: ToolOutcome) -> Self {
        self.registry
            .lock()
            .unwrap()
            .servers
            .entry(server.to_string())
            .or_default()
            .push((spec, outcome));
        self
    }

    /// A tool with a one-property `query` schema returning `result`.
    pub fn with_simple_tool(self, server: &str, name: &str, result: serde_json::Value) -> Self {
        let spec = ToolSpec {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"],
            }),
        };
        self.with_tool(server, spec, ToolOutcome::success(result))
    }

    /// `(server, tool, arguments)` of every invocation, oldest first.
    pub fn invocations(&self) -> Vec<(String, String, serde_json::Value)> {
        self.registry.lock().unwrap().invocations.clone()
    }
}

impl ToolInvoker for RecordingToolInvoker {
    fn list_tools(
        &self,
        _ctx: &ToolCallContext,
        server_type: &str,
    ) -> BoxFuture<'_, Result<Vec<ToolSpec>>> {
        let specs = self
            .registry
            .lock()
            .unwrap()
            .servers
            .get(server_type)
            .map(|tools| tools.iter().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(specs) })
    }

    fn invoke(
        &self,
        _ctx: &ToolCallContext,
        server_type: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let mut registry = self.registry.lock().unwrap();
        registry
            .invocations
            .push((server_type.to_string(), tool_name.to_string(), args));
        let outcome = registry
            .servers
            .get(server_type)
            .and_then(|tools| tools.iter().find(|(spec, _)| spec.name == tool_name))
            .map(|(_, outcome)| outcome.clone())
            .ok_or_else(|| ConfluxError::ToolNotFound {
                server: server_type.to_string(),
                tool: tool_name.to_string(),
            });
        Box::pin(async move { outcome })
    }
}
