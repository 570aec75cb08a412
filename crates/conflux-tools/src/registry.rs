use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info};

use conflux_core::config::ToolsConfig;
use conflux_core::error::{ConfluxError, Result};
use conflux_core::traits::ToolInvoker;
use conflux_core::types::{ToolCallContext, ToolOutcome, ToolSpec};

use crate::builtin::http::{HttpRequestTool, HTTP_SERVER};
use crate::Tool;

/// Registry of tool servers, each a named set of tools.
pub struct ToolRegistry {
    servers: HashMap<String, BTreeMap<String, Arc<dyn Tool>>>,
    default_timeout_secs: u64,
}

impl ToolRegistry {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            servers: HashMap::new(),
            default_timeout_secs,
        }
    }

    /// Create a registry with the built-in servers enabled by config.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new(config.timeout_secs);
        if config.enable_http {
            registry.register(HTTP_SERVER, HttpRequestTool::new()?);
        }
        info!(
            servers = registry.servers.len(),
            timeout_secs = config.timeout_secs,
            "Tool registry ready"
        );
        Ok(registry)
    }

    /// Register a tool under a server type.
    pub fn register(&mut self, server_type: &str, tool: impl Tool) {
        let name = tool.name().to_string();
        self.servers
            .entry(server_type.to_string())
            .or_default()
            .insert(name, Arc::new(tool));
    }

    /// Unregister a tool; returns whether it existed.
    pub fn unregister(&mut self, server_type: &str, name: &str) -> bool {
        let Some(tools) = self.servers.get_mut(server_type) else {
            return false;
        };
        let removed = tools.remove(name).is_some();
        if tools.is_empty() {
            self.servers.remove(server_type);
        }
        removed
    }

    pub fn get(&self, server_type: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.servers.get(server_type)?.get(name).cloned()
    }

    pub fn server_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.servers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Tool specs of a server, ordered by tool name. Unknown servers list nothing.
    pub fn specs(&self, server_type: &str) -> Vec<ToolSpec> {
        self.servers
            .get(server_type)
            .map(|tools| {
                tools
                    .values()
                    .map(|t| ToolSpec {
                        name: t.name().to_string(),
                        description: t.description().to_string(),
                        input_schema: t.input_schema(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Execute a tool under its timeout.
    pub async fn execute(
        &self,
        ctx: &ToolCallContext,
        server_type: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let tool = self
            .get(server_type, name)
            .ok_or_else(|| ConfluxError::ToolNotFound {
                server: server_type.to_string(),
                tool: name.to_string(),
            })?;

        let timeout_secs = tool.timeout_secs().unwrap_or(self.default_timeout_secs);
        debug!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            server = server_type,
            tool = name,
            timeout_secs,
            "Invoking tool"
        );

        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tool.execute(args, ctx.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConfluxError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }
}

impl ToolInvoker for ToolRegistry {
    fn list_tools(
        &self,
        _ctx: &ToolCallContext,
        server_type: &str,
    ) -> BoxFuture<'_, Result<Vec<ToolSpec>>> {
        let specs = self.specs(server_type);
        Box::pin(async move { Ok(specs) })
    }

    fn invoke(
        &self,
        ctx: &ToolCallContext,
        server_type: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let ctx = ctx.clone();
        let server_type = server_type.to_string();
        let tool_name = tool_name.to_string();
        Box::pin(async move { self.execute(&ctx, &server_type, &tool_name, args).await })
    }
}
