use serde_json::json;

use anvil_llm::ToolDefinition;

pub const SESSIONS_SPAWN_TOOL: &str = "sessions_spawn";
pub const SUBAGENTS_TOOL: &str = "subagents";

/// Schemas for the orchestration tools. Their handlers live on the agent,
/// which intercepts these names before regular dispatch.
pub fn orchestration_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            SESSIONS_SPAWN_TOOL,
            "Spawn a subagent session and optionally run an initial task.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "Initial task for the subagent."},
                    "provider": {"type": "string", "description": "Optional provider override."},
                    "model": {"type": "string", "description": "Optional model override."},
                    "run_now": {
                        "type": "boolean",
                        "description": "If true, run the task immediately and return a first reply.",
                        "default": true
                    },
                    "background": {
                        "type": "boolean",
                        "description": "If true and run_now=true, run in background and return immediately.",
                        "default": true
                    }
                },
                "required": ["task"]
            }),
        ),
        ToolDefinition::new(
            SUBAGENTS_TOOL,
            "List, inspect, steer, or kill existing subagent runs for this session.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["list", "get_result", "events", "steer", "kill"],
                        "description": "Operation to perform."
                    },
                    "run_id": {
                        "type": "string",
                        "description": "Subagent run id (required for every action except list)."
                    },
                    "message": {"type": "string", "description": "Message for the steer action."}
                },
                "required": ["action"]
            }),
        ),
    ]
}
