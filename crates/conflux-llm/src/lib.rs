pub mod providers;
pub mod registry;
pub mod retry;

use std::sync::Arc;

use conflux_core::config::{ProviderConfig, ProviderKind};
use conflux_core::error::Result;
use conflux_core::traits::ModelClient;
use conflux_core::types::TokenUsage;

pub use registry::ProviderRegistry;
pub use retry::RetryingClient;

/// Create a model client for the configured provider kind, wrapped in a
/// retry layer when the provider declares one.
pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn ModelClient>> {
    let client: Arc<dyn ModelClient> = match config.kind {
        ProviderKind::Anthropic => Arc::new(providers::anthropic::AnthropicClient::new(
            config.clone(),
        )?),
        ProviderKind::Openai => Arc::new(providers::openai::OpenAiClient::new(config.clone())?),
    };

    Ok(match &config.retry {
        Some(retry) => Arc::new(RetryingClient::new(client, retry.clone())),
        None => client,
    })
}

/// Dollar cost of a call at the provider's per-million-token rates.
pub fn estimate_cost(usage: &TokenUsage, config: &ProviderConfig) -> f64 {
    (usage.input_tokens as f64 * config.input_cost_per_mtok
        + usage.output_tokens as f64 * config.output_cost_per_mtok)
        / 1_000_000.0
}
