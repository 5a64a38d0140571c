mod fs;
mod orchestration;
mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use anvil_llm::ToolDefinition;

use crate::errors::ToolError;
use crate::steering::CancelToken;

pub use orchestration::{
    orchestration_tool_definitions, SESSIONS_SPAWN_TOOL, SUBAGENTS_TOOL,
};

pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";
pub const LIST_DIR_TOOL: &str = "list_dir";
pub const RUN_CMD_TOOL: &str = "run_cmd";

/// Every captured tool failure becomes a result whose text starts with this
/// prefix and whose `details.kind` is `"error"`.
pub const TOOL_ERROR_PREFIX: &str = "[Tool Error]";

pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Execution context handed to every tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub workspace_dir: PathBuf,
    pub cancel: CancelToken,
    pub on_progress: Option<ProgressFn>,
}

impl ToolContext {
    pub fn progress(&self, text: &str) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(text);
        }
    }

    /// Resolve a tool-supplied path against the workspace root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.workspace_dir.join(candidate)
        }
    }
}

/// Result of one tool execution. `details` is opaque to the core and passes
/// through to the event stream verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub details: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            details: None,
        }
    }

    pub fn structured(text: impl Into<String>, details: Value) -> Self {
        Self {
            text: text.into(),
            details: Some(details),
        }
    }

    pub fn is_error(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|details| details.get("kind"))
            .and_then(Value::as_str)
            == Some("error")
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

pub type ToolFuture = BoxFuture<'static, Result<ToolOutput, ToolError>>;
pub type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: ToolHandler,
}

/// Resolves tool names to handlers and executes them with a structured
/// result. Dispatch is synchronous from the loop's point of view; handlers
/// must honor the cancellation token and return promptly once it trips.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn builtins() -> Self {
        let mut registry = Self::default();
        registry.register(fs::read_file_tool());
        registry.register(fs::write_file_tool());
        registry.register(fs::list_dir_tool());
        registry.register(shell::run_cmd_tool());
        registry
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Execute one call, capturing every failure as an error-marked result.
    pub async fn dispatch(&self, name: &str, arguments_json: &str, ctx: ToolContext) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return error_output(name, ToolError::UnknownTool(name.to_string()).to_string());
        };

        let arguments: Value = if arguments_json.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments_json) {
                Ok(value) => value,
                Err(error) => {
                    return error_output(name, format!("failed to parse tool arguments: {error}"));
                }
            }
        };

        if let Err(error) = validate_arguments(&tool.definition.parameters, &arguments) {
            return error_output(name, error.to_string());
        }

        match (tool.handler)(arguments, ctx).await {
            Ok(output) => output,
            Err(error) => error_output(name, error.to_string()),
        }
    }
}

pub(crate) fn error_output(name: &str, message: impl Into<String>) -> ToolOutput {
    ToolOutput::structured(
        format!("{TOOL_ERROR_PREFIX} {name}: {}", message.into()),
        json!({"kind": "error"}),
    )
}

/// Minimal schema check: arguments must be an object carrying every
/// `required` key.
fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    if !arguments.is_object() {
        return Err(ToolError::Validation(
            "tool arguments must be a JSON object".to_string(),
        ));
    }
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for key in required.iter().filter_map(Value::as_str) {
        if arguments.get(key).is_none() {
            return Err(ToolError::Validation(format!(
                "missing required argument '{key}'"
            )));
        }
    }
    Ok(())
}

pub(crate) fn required_string_argument(arguments: &Value, key: &str) -> Result<String, ToolError> {
    optional_string_argument(arguments, key)?
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{key}'")))
}

pub(crate) fn optional_string_argument(
    arguments: &Value,
    key: &str,
) -> Result<Option<String>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let Some(value) = value.as_str() else {
        return Err(ToolError::Validation(format!(
            "argument '{key}' must be a string"
        )));
    };
    Ok(Some(value.to_string()))
}

pub(crate) fn optional_bool_argument(
    arguments: &Value,
    key: &str,
) -> Result<Option<bool>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let Some(value) = value.as_bool() else {
        return Err(ToolError::Validation(format!(
            "argument '{key}' must be a boolean"
        )));
    };
    Ok(Some(value))
}

/// Head/tail truncation for oversized tool results, biased toward the head.
pub fn truncate_tool_result(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let omitted = total - max_chars;
    let head_chars = (max_chars * 2) / 3;
    let tail_chars = max_chars - head_chars;
    let head: String = text.chars().take(head_chars).collect();
    let tail: String = text.chars().skip(total - tail_chars).collect();
    format!(
        "{head}\n\n...[output truncated: omitted {omitted} chars for context safety]...\n\n{tail}"
    )
}
