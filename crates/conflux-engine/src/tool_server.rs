//! ToolServer nodes.
//!
//! The node looks for a structured call in its upstream input
//! (`{"tool": ..., "arguments": {...}}`, bare or inside a ```json fence).
//! Without one it calls the configured tool, or the first tool the server
//! lists, with the configured arguments or the upstream text. Tool failures
//! never fail the run; they become the node's output.

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use conflux_core::error::ConfluxError;
use conflux_core::graph::{Node, ToolServerConfig};
use conflux_core::state::ExecutionState;
use conflux_core::types::{
    MessageDraft, MessageKind, MessageMetadata, ToolCallContext, ToolOutcome, ToolSpec,
};

use crate::runtime::{NodeOutput, NodeRuntime};

/// A resolved tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: Value,
}

pub(crate) async fn run_tool_server(
    rt: &NodeRuntime,
    state: &ExecutionState,
    node: &Node,
    config: &ToolServerConfig,
    input: &str,
) -> NodeOutput {
    let ctx = ToolCallContext {
        execution_id: state.id.clone(),
        node_id: node.id.clone(),
        project: state.project.clone(),
    };

    let tools = match rt.tools.list_tools(&ctx, &config.server_type).await {
        Ok(tools) => tools,
        Err(e) => {
            warn!(node_id = %node.id, server = %config.server_type, error = %e, "Listing tools failed");
            Vec::new()
        }
    };

    let (tool, text) = match resolve_call(input, config, &tools) {
        Some(call) => {
            debug!(node_id = %node.id, tool = %call.tool, "Invoking tool");
            let text = match rt
                .tools
                .invoke(&ctx, &config.server_type, &call.tool, call.arguments)
                .await
            {
                Ok(outcome) => render_outcome(&outcome),
                Err(e) => tool_error(&e),
            };
            (Some(call.tool), text)
        }
        None => (
            None,
            format!("Tool error: no tools available on server '{}'", config.server_type),
        ),
    };

    let mut out = NodeOutput::new(&text);
    out.push(
        MessageDraft::new(&node.name, node.kind(), MessageKind::ToolResponse, &text).with_metadata(
            MessageMetadata {
                node_id: Some(node.id.clone()),
                tool,
                ..Default::default()
            },
        ),
    );
    out.say(&node.name, &text);
    out
}

/// Decide which tool to call and with what arguments.
pub fn resolve_call(input: &str, config: &ToolServerConfig, tools: &[ToolSpec]) -> Option<ToolCall> {
    if let Some(call) = structured_call(input) {
        if tools.is_empty() || tools.iter().any(|t| t.name == call.tool) {
            return Some(call);
        }
        warn!(tool = %call.tool, "Structured call names an unknown tool, using default");
    }

    let tool = config
        .tool
        .clone()
        .or_else(|| tools.first().map(|t| t.name.clone()))?;

    let arguments = match &config.arguments {
        Some(args) => args.clone(),
        None => {
            let key = tools
                .iter()
                .find(|t| t.name == tool)
                .and_then(first_required_property)
                .unwrap_or_else(|| "input".to_string());
            let mut map = Map::new();
            map.insert(key, Value::String(input.to_string()));
            Value::Object(map)
        }
    };

    Some(ToolCall { tool, arguments })
}

/// A call spelled out in upstream output, if any.
pub fn structured_call(input: &str) -> Option<ToolCall> {
    candidate_objects(input)
        .into_iter()
        .find_map(|value| call_from_value(&value))
}

fn candidate_objects(input: &str) -> Vec<Value> {
    let mut out = Vec::new();
    if let Ok(v) = serde_json::from_str::<Value>(input.trim()) {
        out.push(v);
    }
    if let Ok(fence) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```") {
        for cap in fence.captures_iter(input) {
            if let Ok(v) = serde_json::from_str::<Value>(&cap[1]) {
                out.push(v);
            }
        }
    }
    out
}

fn call_from_value(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let tool = ["tool", "tool_name", "name"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))?;
    let arguments = ["arguments", "args"]
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or_else(|| json!({}));
    Some(ToolCall {
        tool: tool.to_string(),
        arguments,
    })
}

fn first_required_property(spec: &ToolSpec) -> Option<String> {
    spec.input_schema
        .get("required")?
        .as_array()?
        .first()?
        .as_str()
        .map(str::to_string)
}

fn render_outcome(outcome: &ToolOutcome) -> String {
    if !outcome.success {
        return format!(
            "Tool error: {}",
            outcome.error.as_deref().unwrap_or("tool reported failure")
        );
    }
    match &outcome.result {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn tool_error(e: &ConfluxError) -> String {
    format!("Tool error: {}", e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tool: Option<&str>) -> ToolServerConfig {
        ToolServerConfig {
            server_type: "search".into(),
            tool: tool.map(str::to_string),
            arguments: None,
        }
    }

    fn spec(name: &str, schema: Value) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            input_schema: schema,
        }
    }

    #[test]
    fn test_structured_call_bare_and_fenced() {
        let call = structured_call(r#"{"tool": "lookup", "arguments": {"q": "rust"}}"#).unwrap();
        assert_eq!(call.tool, "lookup");
        assert_eq!(call.arguments["q"], "rust");

        let text = "I will search.\n```json\n{\"name\": \"lookup\", \"args\": {\"q\": \"tokio\"}}\n```\nDone.";
        let call = structured_call(text).unwrap();
        assert_eq!(call.arguments["q"], "tokio");

        assert!(structured_call("plain prose").is_none());
    }

    #[test]
    fn test_default_call_uses_required_property() {
        let tools = vec![spec(
            "lookup",
            json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
        )];
        let call = resolve_call("find crates", &config(None), &tools).unwrap();
        assert_eq!(call.tool, "lookup");
        assert_eq!(call.arguments, json!({"query": "find crates"}));
    }

    #[test]
    fn test_configured_tool_and_arguments() {
        let mut cfg = config(Some("fetch"));
        cfg.arguments = Some(json!({"url": "https://example.com"}));
        let call = resolve_call("ignored", &cfg, &[]).unwrap();
        assert_eq!(call.tool, "fetch");
        assert_eq!(call.arguments["url"], "https://example.com");
    }

    #[test]
    fn test_unknown_structured_tool_falls_back() {
        let tools = vec![spec("lookup", json!({}))];
        let call = resolve_call(r#"{"tool": "nope"}"#, &config(None), &tools).unwrap();
        assert_eq!(call.tool, "lookup");
        assert_eq!(call.arguments["input"], r#"{"tool": "nope"}"#);
    }

    #[test]
    fn test_no_tools_resolves_nothing() {
        assert!(resolve_call("x", &config(None), &[]).is_none());
    }

    #[test]
    fn test_render_failure() {
        let text = render_outcome(&ToolOutcome::failure("rate limited"));
        assert_eq!(text, "Tool error: rate limited");
        assert_eq!(render_outcome(&ToolOutcome::success(json!("ok"))), "ok");
    }
}
