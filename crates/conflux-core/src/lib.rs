pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ConfluxError, Result};
pub use event::EventBus;
pub use graph::{Edge, EdgeKind, Graph, Node, NodeConfig, NodeKind};
pub use state::{ExecutionState, HumanInput, RunOutcome, StateField, SuspensionDescriptor};
pub use types::*;
