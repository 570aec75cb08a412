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

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    http: Client,
    config: ProviderConfig,
}

impl AnthropicClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfluxError::LlmRequest(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn build_request(request: &GenerateRequest) -> AnthropicRequest {
    AnthropicRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: Some(request.temperature),
        messages: vec![ApiMessage {
            role: "user",
            content: request.prompt.clone(),
        }],
        system: request.system_prompt.clone(),
    }
}

/// Concatenate the text blocks of a response.
fn parse_response(body: AnthropicResponse) -> (String, TokenUsage) {
    let text = body
        .content
        .into_iter()
        .filter(|b| b.r#type == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");
    let usage = body
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
        .unwrap_or_default();
    (text, usage)
}

impl ModelClient for AnthropicClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| ConfluxError::Config("Anthropic API key not set".into()))?;
            let url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let body = build_request(&request);

            debug!(model = %request.model, url, "Sending messages request");
            let response = self
                .http
                .post(url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ConfluxError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(ConfluxError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: AnthropicResponse = response
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_max_tokens() {
        let request = GenerateRequest {
            prompt: "Hi".into(),
            system_prompt: None,
            model: "claude-sonnet-4".into(),
            temperature: 0.7,
            max_tokens: None,
        };
        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_joins_text_blocks() {
        let body: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"Hello "},{"type":"tool_use","id":"x"},{"type":"text","text":"there"}],
                "usage":{"input_tokens":5,"output_tokens":2}}"#,
        )
        .unwrap();
        let (text, usage) = parse_response(body);
        assert_eq!(text, "Hello there");
        assert_eq!(usage.total(), 7);
    }
}
