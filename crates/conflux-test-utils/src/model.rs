use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::graph::ModelSettings;
use conflux_core::traits::{ModelClient, ModelProvider};
use conflux_core::types::{GenerateRequest, Generation, TokenUsage};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Whitespace-only content.
    Empty,
}

#[derive(Default)]
struct Shared {
    scripts: HashMap<String, VecDeque<Reply>>,
    prompts: HashMap<String, Vec<String>>,
    unknown_providers: HashSet<String>,
}

/// Model provider that answers from per-model scripts.
///
/// Unscripted calls answer `"{model} reply {n}"`, where `n` counts the
/// calls made to that model so far (starting at 1).
#[derive(Clone, Default)]
pub struct ScriptedModel {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, model: &str, text: &str) -> Self {
        self.push(model, Reply::Text(text.to_string()))
    }

    pub fn fail(self, model: &str, message: &str) -> Self {
        self.push(model, Reply::Fail(message.to_string()))
    }

    pub fn empty(self, model: &str) -> Self {
        self.push(model, Reply::Empty)
    }

    /// Make `client_for` reject every node configured with `provider`.
    pub fn without_provider(self, provider: &str) -> Self {
        self.shared
            .lock()
            .unwrap()
            .unknown_providers
            .insert(provider.to_string());
        self
    }

    fn push(self, model: &str, reply: Reply) -> Self {
        self.shared
            .lock()
            .unwrap()
            .scripts
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Number of calls made to `model`.
    pub fn calls(&self, model: &str) -> usize {
        self.prompts(model).len()
    }

    pub fn total_calls(&self) -> usize {
        self.shared.lock().unwrap().prompts.values().map(Vec::len).sum()
    }

    /// Prompts sent to `model`, oldest first.
    pub fn prompts(&self, model: &str) -> Vec<String> {
        self.shared
            .lock()
            .unwrap()
            .prompts
            .get(model)
            .cloned()
            .unwrap_or_default()
    }

    fn answer(&self, request: &GenerateRequest) -> Result<Generation> {
        let mut shared = self.shared.lock().unwrap();
        let prompts = shared.prompts.entry(request.model.clone()).or_default();
        prompts.push(request.prompt.clone());
        let n = prompts.len();

        let scripted = shared
            .scripts
            .get_mut(&request.model)
            .and_then(|queue| queue.pop_front());
        let text = match scripted {
            Some(Reply::Text(text)) => text,
            Some(Reply::Empty) => "   ".to_string(),
            Some(Reply::Fail(message)) => return Err(ConfluxError::LlmRequest(message)),
            None => format!("{} reply {}", request.model, n),
        };
        Ok(Generation {
            usage: TokenUsage {
                input_tokens: request.prompt.len() as u64,
                output_tokens: text.len() as u64,
            },
            cost_estimate: 0.0,
            text,
        })
    }
}

impl ModelProvider for ScriptedModel {
    fn client_for(
        &self,
        _project: Option<&str>,
        settings: &ModelSettings,
    ) -> Result<Arc<dyn ModelClient>> {
        if self
            .shared
            .lock()
            .unwrap()
            .unknown_providers
            .contains(&settings.provider)
        {
            return Err(ConfluxError::ProviderNotConfigured(settings.provider.clone()));
        }
        Ok(Arc::new(self.clone()))
    }
}

impl ModelClient for ScriptedModel {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.answer(&request)
        })
    }
}
