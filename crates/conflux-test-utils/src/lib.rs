//! Test doubles and graph fixtures shared by the Conflux crates.
//!
//! [`ScriptedModel`] answers model calls from per-model scripts. Fixture
//! nodes built by [`fixtures`] use their node id as the model name, so a
//! script keyed by node id drives exactly that node.

pub mod fixtures;
mod model;
mod tools;

pub use model::{Reply, ScriptedModel};
pub use tools::RecordingToolInvoker;
