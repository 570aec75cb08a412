use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::types::{ToolCallContext, ToolOutcome};

use crate::Tool;

/// Server type the built-in HTTP tool is registered under.
pub const HTTP_SERVER: &str = "http";

const MAX_BODY_CHARS: usize = 10_000;

pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Conflux/0.1")
            .build()
            .map_err(|e| execution_error(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[derive(Deserialize)]
struct HttpRequestInput {
    /// Accepted as an alias so a node's plain `{"query": ...}` call works.
    #[serde(alias = "query")]
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

fn execution_error(message: String) -> ConfluxError {
    ConfluxError::ToolExecution {
        tool: "http_request".into(),
        message,
    }
}

fn truncate(body: &str, max_chars: usize) -> &str {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Make an HTTP request. Returns status and body."
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "description": "HTTP method (default: GET)" },
                "headers": { "type": "object", "description": "Request headers" },
                "body": { "type": "string", "description": "Request body" }
            },
            "required": ["url"]
        })
    }

    fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        Box::pin(async move {
            let p: HttpRequestInput = match serde_json::from_value(args) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutcome::failure(format!("Invalid arguments: {}", e))),
            };
            let method = match p.method.to_uppercase().parse::<reqwest::Method>() {
                Ok(m) => m,
                Err(e) => return Ok(ToolOutcome::failure(format!("Invalid method: {}", e))),
            };

            debug!(
                execution_id = %ctx.execution_id,
                node_id = %ctx.node_id,
                method = %method,
                url = %p.url,
                "HTTP tool request"
            );

            let mut req = self.client.request(method, &p.url);
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = p.body {
                req = req.body(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| execution_error(format!("Request failed: {}", e)))?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();

            let result = serde_json::json!({
                "status": status.as_u16(),
                "body": truncate(&body, MAX_BODY_CHARS),
            });
            if status.is_success() {
                Ok(ToolOutcome::success(result))
            } else {
                Ok(ToolOutcome {
                    result,
                    success: false,
                    error: Some(format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("")
                    )),
                })
            }
        })
    }
}
