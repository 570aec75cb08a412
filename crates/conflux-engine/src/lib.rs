pub mod audit;
pub mod coordinator;
pub mod engine;
pub mod graph;
pub mod pause;
mod prompt;
pub mod recorder;
pub mod reflection;
pub mod run_log;
mod runtime;
mod scheduler;
pub mod tool_server;

pub use coordinator::{parse_subqueries, Subquery};
pub use engine::WorkflowEngine;
pub use graph::{aggregate, find_inputs, AggregatedContext, ExecutionPlan, UpstreamInput};
pub use recorder::StateRecorder;
pub use reflection::max_iterations;
pub use run_log::RunLogger;
pub use tool_server::{resolve_call, structured_call, ToolCall};
