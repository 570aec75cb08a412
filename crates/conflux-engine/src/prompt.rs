use conflux_core::config::EngineConfig;
use conflux_core::graph::AgentConfig;
use conflux_core::types::GenerateRequest;

/// Prompt for a node's main model call.
pub(crate) fn node_prompt(config: &EngineConfig, history: &str, input: &str) -> String {
    let tail = history_tail(history, config.max_history_chars);
    let mut prompt = String::new();
    if !tail.is_empty() {
        prompt.push_str("Conversation so far:\n");
        prompt.push_str(tail);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Input:\n");
    prompt.push_str(input);
    prompt
}

/// Ask for one more pass over the node's own previous response.
pub(crate) fn self_critique_prompt(instruction: &str, previous: &str) -> String {
    format!("{instruction}\n\nPrevious response:\n{previous}")
}

/// Ask a reviewer for feedback on another node's response.
pub(crate) fn feedback_prompt(instruction: &str, source_name: &str, response: &str) -> String {
    format!("{instruction}\n\nResponse from {source_name}:\n{response}")
}

/// Ask the source to revise using the reviewer's feedback.
pub(crate) fn revision_prompt(instruction: &str, previous: &str, feedback: &str) -> String {
    format!("{instruction}\n\nPrevious response:\n{previous}\n\nFeedback:\n{feedback}")
}

pub(crate) fn request(agent: &AgentConfig, prompt: String) -> GenerateRequest {
    GenerateRequest {
        prompt,
        system_prompt: agent.system_prompt.clone(),
        model: agent.model.model.clone(),
        temperature: agent.model.temperature,
        max_tokens: agent.model.max_tokens,
    }
}

/// Last `max_chars` characters of the transcript, cut at a line start when
/// one is available.
fn history_tail(history: &str, max_chars: usize) -> &str {
    let count = history.chars().count();
    if count <= max_chars {
        return history;
    }
    let skip = count - max_chars;
    let cut = history
        .char_indices()
        .nth(skip)
        .map_or(history.len(), |(i, _)| i);
    let tail = &history[cut..];
    match tail.find('\n') {
        Some(nl) if nl + 1 < tail.len() => &tail[nl + 1..],
        _ => tail,
    }
}
