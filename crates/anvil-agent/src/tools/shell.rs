use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;

use anvil_llm::ToolDefinition;

use super::{
    optional_string_argument, required_string_argument, RegisteredTool, ToolHandler, ToolOutput,
    RUN_CMD_TOOL,
};

const COMMAND_TIMEOUT_SECS: u64 = 30;

pub(super) fn run_cmd_tool() -> RegisteredTool {
    let handler: ToolHandler = std::sync::Arc::new(|arguments, ctx| {
        Box::pin(async move {
            let command_line = required_string_argument(&arguments, "command")?;
            let cwd = optional_string_argument(&arguments, "cwd")?
                .map(|dir| ctx.resolve_path(&dir))
                .unwrap_or_else(|| ctx.workspace_dir.clone());

            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&command_line)
                .current_dir(&cwd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let child = match command.spawn() {
                Ok(child) => child,
                Err(error) => {
                    return Ok(ToolOutput::text(format!("Error running command: {error}")));
                }
            };

            ctx.progress(&format!("running: {command_line}"));
            let cancel = ctx.cancel.clone();
            let waited = tokio::select! {
                waited = tokio::time::timeout(
                    Duration::from_secs(COMMAND_TIMEOUT_SECS),
                    child.wait_with_output(),
                ) => waited,
                _ = cancel.cancelled() => {
                    return Ok(ToolOutput::text(
                        "Error: command cancelled before completion",
                    ));
                }
            };

            let output = match waited {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => {
                    return Ok(ToolOutput::text(format!("Error running command: {error}")));
                }
                Err(_elapsed) => {
                    return Ok(ToolOutput::text(format!(
                        "Error: command timed out ({COMMAND_TIMEOUT_SECS}s limit)"
                    )));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut parts = Vec::new();
            if !stdout.is_empty() {
                parts.push(stdout.to_string());
            }
            if !stderr.is_empty() {
                parts.push(format!("[stderr]\n{stderr}"));
            }
            parts.push(format!(
                "[exit code: {}]",
                output.status.code().unwrap_or(-1)
            ));
            Ok(ToolOutput::text(parts.join("\n")))
        })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            RUN_CMD_TOOL,
            "Execute a shell command and return its stdout, stderr, and exit code.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute."},
                    "cwd": {
                        "type": "string",
                        "description": "Working directory for the command. Defaults to the workspace root."
                    }
                },
                "required": ["command"]
            }),
        ),
        handler,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ToolContext, ToolRegistry};
    use crate::steering::CancelToken;
    use serde_json::json;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            session_id: "s1".to_string(),
            workspace_dir: dir.to_path_buf(),
            cancel: CancelToken::new(),
            on_progress: None,
        }
    }

    #[tokio::test]
    async fn command_output_includes_stdout_and_exit_code() {
        let dir = tempdir().expect("tempdir");
        let registry = ToolRegistry::builtins();
        let args = json!({"command": "echo hello"}).to_string();
        let output = registry.dispatch("run_cmd", &args, context(dir.path())).await;
        assert!(output.text.contains("hello"));
        assert!(output.text.contains("[exit code: 0]"));
    }

    #[tokio::test]
    async fn failing_command_reports_stderr_and_nonzero_exit() {
        let dir = tempdir().expect("tempdir");
        let registry = ToolRegistry::builtins();
        let args = json!({"command": "echo oops >&2; exit 3"}).to_string();
        let output = registry.dispatch("run_cmd", &args, context(dir.path())).await;
        assert!(output.text.contains("[stderr]\noops"));
        assert!(output.text.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_a_long_command() {
        let dir = tempdir().expect("tempdir");
        let registry = ToolRegistry::builtins();
        let ctx = context(dir.path());
        ctx.cancel.cancel();
        let args = json!({"command": "sleep 20"}).to_string();
        let output = registry.dispatch("run_cmd", &args, ctx).await;
        assert!(output.text.contains("cancelled"));
    }
}
