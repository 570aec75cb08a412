use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::ModelSettings;
use crate::state::{ExecutionState, StateField};
use crate::types::*;

/// Model client. One text generation per call.
pub trait ModelClient: Send + Sync + 'static {
    /// Generate a completion. Empty content is reported as an error by
    /// the caller, not by the client.
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>>;
}

/// Resolves the model client for a node's configured provider.
pub trait ModelProvider: Send + Sync + 'static {
    fn client_for(
        &self,
        project: Option<&str>,
        settings: &ModelSettings,
    ) -> Result<Arc<dyn ModelClient>>;
}

/// Tool invocation, with tools grouped by server type.
pub trait ToolInvoker: Send + Sync + 'static {
    fn list_tools(
        &self,
        ctx: &ToolCallContext,
        server_type: &str,
    ) -> BoxFuture<'_, Result<Vec<ToolSpec>>>;

    fn invoke(
        &self,
        ctx: &ToolCallContext,
        server_type: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutcome>>;
}

/// Execution store: the persistence backend.
///
/// `save` writes only the listed fields and succeeds only if the stored
/// version equals `state.version`; it returns the new version.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Persist a freshly created execution.
    fn insert(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>>;

    /// Load the latest persisted state.
    fn load(&self, id: &ExecutionId) -> BoxFuture<'_, Result<ExecutionState>>;

    /// Partial update guarded by an optimistic version check.
    fn save(&self, state: &ExecutionState, fields: &[StateField]) -> BoxFuture<'_, Result<u64>>;
}
