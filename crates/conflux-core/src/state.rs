use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, InputMode};
use crate::types::{ExecutionId, ExecutionStatus, Message};

/// Metadata carried by a pause raised from a cross-agent reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionPause {
    /// Node whose response is under review.
    pub reflection_source: String,
    /// The response the human is asked to review.
    pub source_message: String,
    /// 1-based round being reviewed.
    pub iteration: u32,
    pub max_iterations: u32,
}

/// Everything needed to present and later resume a paused execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputContext {
    pub node_id: String,
    pub node_name: String,
    pub prompt_title: String,
    #[serde(default)]
    pub last_message: Option<String>,
    /// Rendered upstream context shown next to the prompt.
    #[serde(default)]
    pub aggregated_context: Option<String>,
    #[serde(default)]
    pub input_mode: InputMode,
    /// Issued for deployment-mode pauses; the input channel must echo it.
    #[serde(default)]
    pub input_token: Option<String>,
    #[serde(default)]
    pub reflection: Option<ReflectionPause>,
}

/// Durable, resumable progress of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    /// Snapshot of the workflow this execution runs.
    pub graph: Graph,
    pub initial_input: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub conversation_history: String,
    /// A node is done iff its id is a key here.
    #[serde(default)]
    pub executed_nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub human_input_context: Option<HumanInputContext>,
    #[serde(default)]
    pub error: Option<String>,
    /// Incremented by every persisted write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(graph: Graph, initial_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            status: ExecutionStatus::Running,
            graph,
            initial_input: initial_input.into(),
            project: None,
            conversation_history: String::new(),
            executed_nodes: BTreeMap::new(),
            messages: Vec::new(),
            human_input_context: None,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn is_executed(&self, node_id: &str) -> bool {
        self.executed_nodes.contains_key(node_id)
    }

    pub fn output_of(&self, node_id: &str) -> Option<&str> {
        self.executed_nodes.get(node_id).map(|s| s.as_str())
    }

    /// Highest sequence number persisted so far (0 when empty).
    pub fn last_sequence(&self) -> u64 {
        self.messages.iter().map(|m| m.sequence).max().unwrap_or(0)
    }

    /// Append a line to the transcript.
    pub fn append_conversation(&mut self, speaker: &str, text: &str) {
        if !self.conversation_history.is_empty() {
            self.conversation_history.push('\n');
        }
        self.conversation_history.push_str(speaker);
        self.conversation_history.push_str(": ");
        self.conversation_history.push_str(text);
    }
}

/// Fields of an [`ExecutionState`] that can be written independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    Status,
    ConversationHistory,
    ExecutedNodes,
    Messages,
    HumanInputContext,
    Error,
}

impl StateField {
    /// Fields touched when a node's output is recorded.
    pub const PROGRESS: &'static [StateField] = &[
        StateField::Status,
        StateField::ConversationHistory,
        StateField::ExecutedNodes,
        StateField::Messages,
        StateField::HumanInputContext,
        StateField::Error,
    ];
}

/// Input supplied by a human to resume a paused execution.
#[derive(Debug, Clone, Default)]
pub struct HumanInput {
    pub text: String,
    /// Must match the pause's input token for deployment-mode pauses.
    pub input_token: Option<String>,
}

impl HumanInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.input_token = Some(token.into());
        self
    }
}

/// What the caller receives when a run suspends for human input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspensionDescriptor {
    pub status: ExecutionStatus,
    pub execution_id: ExecutionId,
    pub target_node: String,
    pub target_name: String,
    pub prompt_title: String,
    pub last_message: Option<String>,
    pub input_mode: InputMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<ReflectionPause>,
}

impl SuspensionDescriptor {
    pub fn from_context(execution_id: &ExecutionId, ctx: &HumanInputContext) -> Self {
        Self {
            status: ExecutionStatus::AwaitingHumanInput,
            execution_id: execution_id.clone(),
            target_node: ctx.node_id.clone(),
            target_name: ctx.node_name.clone(),
            prompt_title: ctx.prompt_title.clone(),
            last_message: ctx.last_message.clone(),
            input_mode: ctx.input_mode,
            input_token: ctx.input_token.clone(),
            reflection: ctx.reflection.clone(),
        }
    }
}

/// Structured result of `start`, `resume` and `continue`.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(Box<ExecutionState>),
    Failed {
        execution_id: ExecutionId,
        error: String,
    },
    Suspended(SuspensionDescriptor),
    Stopped { execution_id: ExecutionId },
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Completed(_) => ExecutionStatus::Completed,
            Self::Failed { .. } => ExecutionStatus::Failed,
            Self::Suspended(_) => ExecutionStatus::AwaitingHumanInput,
            Self::Stopped { .. } => ExecutionStatus::Stopped,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::Completed(state) => &state.id,
            Self::Failed { execution_id, .. } | Self::Stopped { execution_id } => execution_id,
            Self::Suspended(d) => &d.execution_id,
        }
    }
}
