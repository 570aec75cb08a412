use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfluxError, Result};

/// Top-level Conflux configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Scheduler and reflection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reflection bound when neither the edge nor the node sets one.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Upper bound on nodes dispatched concurrently within one generation.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// How much of the transcript tail is included in prompts.
    #[serde(default = "default_max_history_chars")]
    pub max_history_chars: usize,
    /// Retries of an optimistic commit after a version conflict.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
    #[serde(default = "default_pause_fallback_title")]
    pub pause_fallback_title: String,
    #[serde(default = "default_self_critique_prompt")]
    pub self_critique_prompt: String,
    #[serde(default = "default_feedback_prompt")]
    pub feedback_prompt: String,
    #[serde(default = "default_revision_prompt")]
    pub revision_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            max_parallel_nodes: default_max_parallel_nodes(),
            max_history_chars: default_max_history_chars(),
            commit_retries: default_commit_retries(),
            pause_fallback_title: default_pause_fallback_title(),
            self_critique_prompt: default_self_critique_prompt(),
            feedback_prompt: default_feedback_prompt(),
            revision_prompt: default_revision_prompt(),
        }
    }
}

fn default_max_iterations() -> u32 { 2 }
fn default_max_parallel_nodes() -> usize { 8 }
fn default_max_history_chars() -> usize { 12_000 }
fn default_commit_retries() -> u32 { 3 }
fn default_pause_fallback_title() -> String { "Human input required".to_string() }

fn default_self_critique_prompt() -> String {
    "Review your previous response critically. Identify mistakes, gaps, and unclear \
     parts, then reply with an improved version of the full response only."
        .to_string()
}

fn default_feedback_prompt() -> String {
    "Review the following response and give concrete, actionable feedback on how to \
     improve it."
        .to_string()
}

fn default_revision_prompt() -> String {
    "Revise your previous response using the feedback below. Reply with the complete \
     revised response only."
        .to_string()
}

/// Execution store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.conflux/executions.db".to_string() }

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.conflux/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per node, 3 = per reflection step (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("~/.conflux/logs"))
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions and every compatible server.
    #[default]
    Openai,
    Anthropic,
}

/// One named model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            api_key: None,
            timeout_secs: default_provider_timeout(),
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
            retry: None,
        }
    }
}

fn default_provider_timeout() -> u64 { 120 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Tool registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout applied to tools that do not declare their own.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Register the built-in `http` tool server.
    #[serde(default = "default_enable_http")]
    pub enable_http: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            enable_http: default_enable_http(),
        }
    }
}

fn default_tool_timeout() -> u64 { 30 }
fn default_enable_http() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfluxError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConfluxError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    tracing::warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
