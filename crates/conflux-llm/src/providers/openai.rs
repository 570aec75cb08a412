use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use conflux_core::config::ProviderConfig;
use conflux_core::error::{ConfluxError, Result};
use conflux_core::traits::ModelClient;
use conflux_core::types::{GenerateRequest, Generation, TokenUsage};

use crate::estimate_cost;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ProviderConfig,
}

impl OpenAiClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfluxError::LlmRequest(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_request(request: &GenerateRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system_prompt {
        messages.push(OaiMessage {
            role: "system",
            content: system.clone(),
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: request.prompt.clone(),
    });

    // o-series models reject a temperature
    let is_o_series = request.model.starts_with("o1")
        || request.model.starts_with("o3")
        || request.model.starts_with("o4");

    ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: (!is_o_series).then_some(request.temperature),
        stream: false,
    }
}

fn parse_response(body: ChatResponse) -> (String, TokenUsage) {
    let text = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    let usage = body
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    (text, usage)
}

impl ModelClient for OpenAiClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&request);

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            debug!(model = %request.model, url, "Sending chat completion");
            let response = req
                .send()
                .await
                .map_err(|e| ConfluxError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ConfluxError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| ConfluxError::LlmParse(e.to_string()))?;
            let (text, usage) = parse_response(parsed);

            Ok(Generation {
                text,
                cost_estimate: estimate_cost(&usage, &self.config),
                usage,
            })
        })
    }
}
