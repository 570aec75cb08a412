//! Graph analysis: execution order and upstream aggregation.
//!
//! [`ExecutionPlan`] linearizes a workflow into the order the scheduler
//! walks, with the dependency set of every scheduled node. The aggregator
//! merges the recorded outputs of a node's upstream sources into a single
//! context for prompting.

pub mod aggregator;
pub mod parser;

pub use aggregator::{aggregate, find_inputs, AggregatedContext, UpstreamInput};
pub use parser::ExecutionPlan;
