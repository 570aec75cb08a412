use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::NodeKind;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    AwaitingHumanInput,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::AwaitingHumanInput => "AWAITING_HUMAN_INPUT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "AWAITING_HUMAN_INPUT" => Some(Self::AwaitingHumanInput),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an audit-log message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    WorkflowStart,
    WorkflowEnd,
    ReflectionFeedback,
    ReflectionRevision,
    GroupChatSummary,
    DelegateResponse,
    ToolResponse,
    IterationFeedback,
}

/// Token usage reported by a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Structured metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Node whose output this reflection message responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subquery_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// One entry of an execution's audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sequence: u64,
    pub agent_name: String,
    pub agent_type: NodeKind,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Messages authored by a UserProxy count as user-role messages.
    pub fn is_user_role(&self) -> bool {
        self.agent_type == NodeKind::UserProxy
    }

    pub fn is_workflow_marker(&self) -> bool {
        matches!(self.kind, MessageKind::WorkflowStart | MessageKind::WorkflowEnd)
    }
}

/// A message that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub agent_name: String,
    pub agent_type: NodeKind,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: MessageMetadata,
}

impl MessageDraft {
    pub fn new(
        agent_name: impl Into<String>,
        agent_type: NodeKind,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_type,
            content: content.into(),
            kind,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn into_message(self, sequence: u64) -> Message {
        Message {
            sequence,
            agent_name: self.agent_name,
            agent_type: self.agent_type,
            content: self.content,
            kind: self.kind,
            timestamp: Utc::now(),
            metadata: self.metadata,
        }
    }
}

/// A single model invocation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// What a model call returned.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_estimate: f64,
}

/// Description of a tool exposed by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result,
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::Null,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Context passed to the tool-invocation interface.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub project: Option<String>,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run (or a resumed continuation) started.
    RunStarted { execution_id: ExecutionId },
    /// A node was dispatched.
    NodeStarted { execution_id: ExecutionId, node_id: String },
    /// A node's output was recorded.
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        elapsed_ms: u64,
    },
    /// One reflection round finished.
    ReflectionRound {
        execution_id: ExecutionId,
        source: String,
        reviewer: String,
        iteration: u32,
    },
    /// The run needs a human before it can continue.
    HumanInputRequired {
        execution_id: ExecutionId,
        node_id: String,
        prompt_title: String,
    },
    RunCompleted { execution_id: ExecutionId, messages: usize },
    RunFailed { execution_id: ExecutionId, error: String },
    RunStopped { execution_id: ExecutionId },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::ReflectionRound { execution_id, .. }
            | Self::HumanInputRequired { execution_id, .. }
            | Self::RunCompleted { execution_id, .. }
            | Self::RunFailed { execution_id, .. }
            | Self::RunStopped { execution_id } => execution_id,
        }
    }
}
