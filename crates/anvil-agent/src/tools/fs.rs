use serde_json::json;

use anvil_llm::ToolDefinition;

use super::{
    optional_string_argument, required_string_argument, RegisteredTool, ToolHandler, ToolOutput,
    LIST_DIR_TOOL, READ_FILE_TOOL, WRITE_FILE_TOOL,
};

pub(super) fn read_file_tool() -> RegisteredTool {
    let handler: ToolHandler = std::sync::Arc::new(|arguments, ctx| {
        Box::pin(async move {
            let path = ctx.resolve_path(&required_string_argument(&arguments, "path")?);
            if !path.is_file() {
                return Ok(ToolOutput::text(format!(
                    "Error: file not found: {}",
                    path.display()
                )));
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(ToolOutput::text(content)),
                Err(error) => Ok(ToolOutput::text(format!(
                    "Error reading {}: {error}",
                    path.display()
                ))),
            }
        })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            READ_FILE_TOOL,
            "Read the full contents of a file at the given path.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute path, or a path relative to the workspace root."
                    }
                },
                "required": ["path"]
            }),
        ),
        handler,
    }
}

pub(super) fn write_file_tool() -> RegisteredTool {
    let handler: ToolHandler = std::sync::Arc::new(|arguments, ctx| {
        Box::pin(async move {
            let path = ctx.resolve_path(&required_string_argument(&arguments, "path")?);
            let content = required_string_argument(&arguments, "content")?;
            if let Some(parent) = path.parent() {
                if let Err(error) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolOutput::text(format!(
                        "Error writing {}: {error}",
                        path.display()
                    )));
                }
            }
            match tokio::fs::write(&path, content.as_bytes()).await {
                Ok(()) => Ok(ToolOutput::text(format!(
                    "OK: wrote {} chars to {}",
                    content.chars().count(),
                    path.display()
                ))),
                Err(error) => Ok(ToolOutput::text(format!(
                    "Error writing {}: {error}",
                    path.display()
                ))),
            }
        })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            WRITE_FILE_TOOL,
            "Write content to a file. Creates parent directories if they don't exist.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to write to."},
                    "content": {"type": "string", "description": "Content to write into the file."}
                },
                "required": ["path", "content"]
            }),
        ),
        handler,
    }
}

pub(super) fn list_dir_tool() -> RegisteredTool {
    let handler: ToolHandler = std::sync::Arc::new(|arguments, ctx| {
        Box::pin(async move {
            let path = optional_string_argument(&arguments, "path")?
                .unwrap_or_else(|| ".".to_string());
            let path = ctx.resolve_path(&path);
            if !path.is_dir() {
                return Ok(ToolOutput::text(format!(
                    "Error: not a directory: {}",
                    path.display()
                )));
            }
            let mut reader = match tokio::fs::read_dir(&path).await {
                Ok(reader) => reader,
                Err(error) => {
                    return Ok(ToolOutput::text(format!(
                        "Error listing {}: {error}",
                        path.display()
                    )));
                }
            };
            let mut lines = Vec::new();
            while let Ok(Some(entry)) = reader.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                let prefix = match entry.file_type().await {
                    Ok(file_type) if file_type.is_dir() => "d ",
                    _ => "f ",
                };
                lines.push(format!("{prefix}{name}"));
            }
            lines.sort();
            if lines.is_empty() {
                Ok(ToolOutput::text("(empty directory)"))
            } else {
                Ok(ToolOutput::text(lines.join("\n")))
            }
        })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            LIST_DIR_TOOL,
            "List files and subdirectories at the given path.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path to list. Defaults to the workspace root."
                    }
                },
                "required": []
            }),
        ),
        handler,
    }
}
