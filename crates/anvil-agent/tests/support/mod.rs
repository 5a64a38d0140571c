#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use anvil_agent::{
    Agent, AgentConfig, AgentEvent, BufferedEventSink, EventKind, RegisteredTool, ToolOutput,
};
use anvil_llm::{
    ChatMessage, CompletionRequest, Provider, ProviderError, ProviderResponse, TextDeltaSink,
    ToolCall, ToolDefinition, Usage,
};

/// Provider that replays a scripted queue of results and records every
/// request it receives.
pub struct ScriptedProvider {
    results: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ProviderResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn with_delay(responses: Vec<ProviderResponse>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn push_response(&self, response: ProviderResponse) {
        self.results
            .lock()
            .expect("scripted results mutex")
            .push_back(Ok(response));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("scripted requests mutex").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("scripted requests mutex").len()
    }

    /// Highest number of completions observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<ProviderResponse, ProviderError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.requests
            .lock()
            .expect("scripted requests mutex")
            .push(request);
        let result = self
            .results
            .lock()
            .expect("scripted results mutex")
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Fatal("scripted provider exhausted".to_string())));
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let (Ok(response), Some(on_text_delta)) = (&result, on_text_delta.as_ref()) {
            if !response.text().is_empty() {
                on_text_delta(response.text());
            }
        }
        result
    }
}

pub fn assistant_text(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: ChatMessage::assistant(text),
        usage: None,
    }
}

pub fn assistant_text_with_usage(text: &str, usage: Usage) -> ProviderResponse {
    ProviderResponse {
        message: ChatMessage::assistant(text),
        usage: Some(usage),
    }
}

pub fn assistant_with_tools(calls: &[(&str, &str, &str)]) -> ProviderResponse {
    let calls: Vec<ToolCall> = calls
        .iter()
        .map(|(id, name, arguments)| ToolCall::new(*id, *name, *arguments))
        .collect();
    ProviderResponse {
        message: ChatMessage::assistant_with_tool_calls("", calls),
        usage: None,
    }
}

/// Extra tool whose handler echoes back its `x` argument.
pub fn echo_tool() -> RegisteredTool {
    let handler: anvil_agent::ToolHandler = Arc::new(|arguments, _ctx| {
        Box::pin(async move {
            let x = arguments
                .get("x")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(ToolOutput::text(x))
        })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            "echo",
            "Echo the x argument back.",
            serde_json::json!({
                "type": "object",
                "properties": {"x": {"type": "string"}},
                "required": ["x"]
            }),
        ),
        handler,
    }
}

/// Extra tool with a caller-supplied handler body.
pub fn hook_tool(
    name: &str,
    handler: impl Fn() -> Result<ToolOutput, anvil_agent::ToolError> + Send + Sync + 'static,
) -> RegisteredTool {
    let handler = Arc::new(handler);
    let boxed: anvil_agent::ToolHandler = Arc::new(move |_arguments, _ctx| {
        let handler = handler.clone();
        Box::pin(async move { handler() })
    });
    RegisteredTool {
        definition: ToolDefinition::new(
            name,
            "Test tool.",
            serde_json::json!({"type": "object", "properties": {}, "required": []}),
        ),
        handler: boxed,
    }
}

pub fn test_config(dir: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::rooted(dir);
    config.retry_base_seconds = 0.01;
    config
}

pub fn build_agent(
    provider: Arc<ScriptedProvider>,
    config: AgentConfig,
    sink: &BufferedEventSink,
) -> Agent {
    Agent::builder(provider)
        .config(config)
        .session_id("test-session")
        .event_sink(Arc::new(sink.clone()))
        .build()
        .expect("agent builds")
}

pub fn event_kinds(events: &[AgentEvent]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

pub fn turn_end_statuses(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.kind == EventKind::TurnEnd)
        .filter_map(|event| event.data.get_str("status").map(str::to_string))
        .collect()
}

pub fn events_of_kind(events: &[AgentEvent], kind: EventKind) -> Vec<AgentEvent> {
    events
        .iter()
        .filter(|event| event.kind == kind)
        .cloned()
        .collect()
}
