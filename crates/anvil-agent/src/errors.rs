use thiserror::Error;

/// Session journal failures. These abort the loop and surface to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session journal I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session journal record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Session-level failures in orchestration and lifecycle management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("cannot continue: {0}")]
    CannotContinue(String),
}

/// Tool-level failures in lookup, validation, and execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool validation failed: {0}")]
    Validation(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Top-level error type for the anvil-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Provider(#[from] anvil_llm::ProviderError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}
