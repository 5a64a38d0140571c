use std::path::Path;

use anvil_llm::ToolDefinition;

/// Assembles the per-turn system prompt from a stable sectioned template.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    max_tool_output_chars: usize,
    role_block: Option<String>,
}

impl PromptBuilder {
    pub fn new(max_tool_output_chars: usize) -> Self {
        Self {
            max_tool_output_chars,
            role_block: None,
        }
    }

    /// Caller-provided block inserted after the identity section.
    pub fn with_role_block(mut self, role_block: Option<String>) -> Self {
        self.role_block = role_block.filter(|block| !block.trim().is_empty());
        self
    }

    pub fn build(
        &self,
        provider: &str,
        model: &str,
        workspace_dir: &Path,
        tool_summaries: &[(String, String)],
        today: &str,
    ) -> String {
        let mut sections = Vec::new();
        sections.extend(self.identity_section());
        sections.extend(self.tooling_section(tool_summaries));
        sections.extend(self.workspace_runtime_section(provider, model, workspace_dir, today));
        sections.extend(self.safety_section());
        sections.join("\n").trim().to_string()
    }

    fn identity_section(&self) -> Vec<String> {
        let mut lines = vec![
            "## Identity".to_string(),
            "You are a reactive coding agent.".to_string(),
            "Work step-by-step with tools and return concise final answers.".to_string(),
        ];
        if let Some(role_block) = &self.role_block {
            lines.push(role_block.trim().to_string());
        }
        lines.push(String::new());
        lines
    }

    fn tooling_section(&self, tool_summaries: &[(String, String)]) -> Vec<String> {
        let mut lines = vec![
            "## Tooling".to_string(),
            "Use tools when file or shell operations are needed.".to_string(),
            "Prefer reading before writing and avoid guessing file paths.".to_string(),
            "Available tools:".to_string(),
        ];
        for (name, description) in tool_summaries {
            lines.push(format!("- {name}: {description}"));
        }
        lines.push(String::new());
        lines
    }

    fn workspace_runtime_section(
        &self,
        provider: &str,
        model: &str,
        workspace_dir: &Path,
        today: &str,
    ) -> Vec<String> {
        vec![
            "## Workspace and Runtime".to_string(),
            format!("- Workspace root: {}", workspace_dir.display()),
            format!("- Provider/model: {provider}/{model}"),
            format!("- OS: {} {}", std::env::consts::OS, std::env::consts::ARCH),
            format!("- Date: {today}"),
            String::new(),
        ]
    }

    fn safety_section(&self) -> Vec<String> {
        vec![
            "## Safety".to_string(),
            "- For destructive actions, explain intent clearly before executing.".to_string(),
            "- Keep command outputs concise and summarize key results.".to_string(),
            format!(
                "- If a tool output is very long, keep the most relevant parts (target <= {} chars).",
                self.max_tool_output_chars
            ),
            String::new(),
        ]
    }
}

/// Union of built-in and caller-supplied tool descriptors. Names must be
/// unique; on collision the extra tool wins and the collided name is
/// reported so the loop can emit a warning.
pub fn merge_tool_definitions(
    builtin: Vec<ToolDefinition>,
    extra: &[ToolDefinition],
) -> (Vec<ToolDefinition>, Vec<String>) {
    let mut collisions = Vec::new();
    let mut merged: Vec<ToolDefinition> = builtin;
    for tool in extra {
        if let Some(existing) = merged.iter_mut().find(|t| t.name == tool.name) {
            collisions.push(tool.name.clone());
            *existing = tool.clone();
        } else {
            merged.push(tool.clone());
        }
    }
    (merged, collisions)
}

/// Compact `(name, description)` pairs for prompt building.
pub fn tool_summaries(definitions: &[ToolDefinition]) -> Vec<(String, String)> {
    definitions
        .iter()
        .map(|tool| (tool.name.clone(), tool.description.clone()))
        .collect()
}
