pub mod builtin;
pub mod registry;

use futures::future::BoxFuture;

use conflux_core::error::Result;
use conflux_core::types::{ToolCallContext, ToolOutcome};

pub use registry::ToolRegistry;

/// A tool exposed by a tool server.
pub trait Tool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn input_schema(&self) -> serde_json::Value;

    /// Per-tool timeout; `None` uses the registry default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Run the tool. A failure the caller should see as data is an
    /// unsuccessful `ToolOutcome`; `Err` is reserved for transport failures.
    fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>>;
}
