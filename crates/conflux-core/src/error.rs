use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfluxError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    Graph(String),

    #[error("Node '{node}' is missing upstream output from '{missing}'")]
    Dependency { node: String, missing: String },

    // Model errors
    #[error("Model call failed for node '{node}': {message}")]
    Model { node: String, message: String },

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("No model provider configured: {0}")]
    ProviderNotConfigured(String),

    // Tool errors
    #[error("Tool not found: {server}/{tool}")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Execution state errors
    #[error("Cannot resume execution {execution}: {reason}")]
    ResumeState { execution: String, reason: String },

    #[error("Message sequence {0} is already taken")]
    SequenceConflict(u64),

    #[error("Execution {execution} was modified concurrently (expected version {expected}, found {found})")]
    StoreConflict {
        execution: String,
        expected: u64,
        found: u64,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfluxError {
    /// Whether a node-level failure should terminate the run.
    ///
    /// Tool failures are recorded as the node's output instead.
    pub fn is_fatal_for_run(&self) -> bool {
        !matches!(
            self,
            ConfluxError::ToolNotFound { .. }
                | ConfluxError::ToolExecution { .. }
                | ConfluxError::ToolTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConfluxError>;
