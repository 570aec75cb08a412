use std::sync::Arc;

use tracing::{debug, warn};

use conflux_core::config::EngineConfig;
use conflux_core::error::{ConfluxError, Result};
use conflux_core::event::EventBus;
use conflux_core::graph::{AgentConfig, Node};
use conflux_core::state::{ExecutionState, ReflectionPause};
use conflux_core::traits::{ModelProvider, ToolInvoker};
use conflux_core::types::{MessageDraft, MessageMetadata, TokenUsage};

use crate::{audit, prompt};

/// Collaborators shared by every node dispatch.
pub(crate) struct NodeRuntime {
    pub models: Arc<dyn ModelProvider>,
    pub tools: Arc<dyn ToolInvoker>,
    pub events: Arc<EventBus>,
    pub config: EngineConfig,
}

/// A successful, non-empty model response.
#[derive(Debug, Clone)]
pub(crate) struct ModelReply {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

impl ModelReply {
    pub fn metadata(&self, node_id: &str) -> MessageMetadata {
        MessageMetadata {
            node_id: Some(node_id.to_string()),
            provider: Some(self.provider.clone()),
            model: Some(self.model.clone()),
            usage: Some(self.usage),
            cost: Some(self.cost),
            ..Default::default()
        }
    }
}

impl NodeRuntime {
    /// One model call on behalf of `node`. Provider resolution failures,
    /// request failures and empty content are all model errors.
    pub async fn call_model(
        &self,
        project: Option<&str>,
        node: &Node,
        agent: &AgentConfig,
        prompt_text: String,
    ) -> Result<ModelReply> {
        let model_err = |message: String| ConfluxError::Model {
            node: node.id.clone(),
            message,
        };

        let client = self
            .models
            .client_for(project, &agent.model)
            .map_err(|e| model_err(e.to_string()))?;

        debug!(node_id = %node.id, model = %agent.model.model, "Calling model");
        let generation = client
            .generate(prompt::request(agent, prompt_text))
            .await
            .map_err(|e| model_err(e.to_string()))?;

        if generation.text.trim().is_empty() {
            warn!(node_id = %node.id, "Model returned empty content");
            return Err(model_err("model returned empty content".to_string()));
        }

        Ok(ModelReply {
            text: generation.text,
            provider: agent.model.provider.clone(),
            model: agent.model.model.clone(),
            usage: generation.usage,
            cost: generation.cost_estimate,
        })
    }
}

/// What a dispatched node contributes to the execution.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeOutput {
    /// Recorded as the node's entry in `executed_nodes`.
    pub output: String,
    /// `(speaker, text)` lines appended to the transcript.
    pub transcript: Vec<(String, String)>,
    pub messages: Vec<MessageDraft>,
}

impl NodeOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn say(&mut self, speaker: &str, text: &str) {
        self.transcript.push((speaker.to_string(), text.to_string()));
    }

    pub fn push(&mut self, draft: MessageDraft) {
        self.messages.push(draft);
    }

    /// Apply to `state`: record the output for `node_id` (when given), then
    /// the transcript lines and messages. A node that is already executed is
    /// left untouched and `false` is returned.
    pub fn record(&self, state: &mut ExecutionState, node_id: Option<&str>) -> bool {
        if let Some(id) = node_id {
            if state.is_executed(id) {
                return false;
            }
            state.executed_nodes.insert(id.to_string(), self.output.clone());
        }
        for (speaker, text) in &self.transcript {
            state.append_conversation(speaker, text);
        }
        audit::append(state, self.messages.clone());
        true
    }
}

/// A response routed to a human reviewer.
#[derive(Debug, Clone)]
pub(crate) struct ReviewRequest {
    pub reviewer: String,
    pub reflection: ReflectionPause,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeOutcome {
    Finished(NodeOutput),
    /// The source's response so far (recorded, but the node is not yet
    /// executed) and the pause to raise.
    AwaitingReview {
        partial: NodeOutput,
        review: ReviewRequest,
    },
}

#[derive(Debug)]
pub(crate) struct NodeRun {
    pub node_id: String,
    pub result: Result<NodeOutcome>,
    pub elapsed_ms: u64,
}
