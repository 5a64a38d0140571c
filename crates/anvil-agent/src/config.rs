use std::path::PathBuf;

use crate::context::ContextConfig;

/// Immutable runtime configuration, constructed once at agent creation.
/// Environment parsing lives in the front-end, not here.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    pub workspace_dir: PathBuf,
    pub sessions_dir: PathBuf,
    /// Expose the `sessions_spawn` / `subagents` orchestration tools.
    pub enable_orchestration: bool,
    pub max_tool_rounds: usize,
    /// Tool results longer than this are head/tail truncated before they are
    /// appended to the session.
    pub max_tool_result_chars: usize,
    pub max_retries: u32,
    pub retry_base_seconds: f64,
    pub max_concurrent: usize,
    pub lane_warn_wait_ms: u64,
    pub context: ContextConfig,
    pub subagents: SubagentConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubagentConfig {
    pub max_depth: usize,
    pub max_workers: usize,
    /// 0 disables the per-run timeout.
    pub run_timeout_seconds: u64,
    /// Append a summary message to the parent session when a background run
    /// completes.
    pub announce_completion: bool,
    /// Most recent events retained per run, oldest evicted.
    pub event_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            workspace_dir: PathBuf::from("."),
            sessions_dir: PathBuf::from("sessions"),
            enable_orchestration: true,
            max_tool_rounds: 20,
            max_tool_result_chars: 8_000,
            max_retries: 2,
            retry_base_seconds: 1.0,
            max_concurrent: 4,
            lane_warn_wait_ms: 1_200,
            context: ContextConfig::default(),
            subagents: SubagentConfig::default(),
        }
    }
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_workers: 2,
            run_timeout_seconds: 0,
            announce_completion: false,
            event_buffer: 256,
        }
    }
}

impl AgentConfig {
    /// Convenience for tests and embedders that keep everything under one
    /// directory.
    pub fn rooted(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            workspace_dir: dir.clone(),
            sessions_dir: dir,
            ..Self::default()
        }
    }
}
