use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use anvil_llm::{MessageSource, Role, ToolCall};

use crate::store::utc_now_iso;

/// Payload map for one lifecycle event. Consumers must tolerate unknown
/// keys; new payload fields are additive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData {
    inner: HashMap<String, Value>,
}

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.inner.insert(key.into(), value);
    }

    pub fn insert_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert_value(key, Value::String(value.into()));
    }

    pub fn insert_bool(&mut self, key: impl Into<String>, value: bool) {
        self.insert_value(key, Value::Bool(value));
    }

    pub fn insert_u64(&mut self, key: impl Into<String>, value: u64) {
        self.insert_value(key, Value::from(value));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    MessageStart,
    MessageUpdate,
    MessageEnd,
    ToolExecutionStart,
    ToolExecutionUpdate,
    ToolExecutionEnd,
    LaneWait,
    Warning,
}

/// Terminal status of one round, carried on `turn_end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    ToolCallsProcessed,
    Steered,
    FollowUpInjected,
    Cancelled,
    LoopDetected,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ToolCallsProcessed => "tool_calls_processed",
            Self::Steered => "steered",
            Self::FollowUpInjected => "follow_up_injected",
            Self::Cancelled => "cancelled",
            Self::LoopDetected => "loop_detected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: String,
    pub session_id: String,
    #[serde(flatten)]
    pub data: EventData,
}

impl AgentEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, data: EventData) -> Self {
        Self {
            kind,
            timestamp: utc_now_iso(),
            session_id: session_id.into(),
            data,
        }
    }

    pub fn agent_start(session_id: impl Into<String>) -> Self {
        Self::new(EventKind::AgentStart, session_id, EventData::new())
    }

    pub fn agent_end(session_id: impl Into<String>, final_text: impl Into<String>) -> Self {
        let mut data = EventData::new();
        data.insert_string("final_text", final_text);
        Self::new(EventKind::AgentEnd, session_id, data)
    }

    pub fn turn_start(session_id: impl Into<String>, round: usize) -> Self {
        let mut data = EventData::new();
        data.insert_u64("round", round as u64);
        Self::new(EventKind::TurnStart, session_id, data)
    }

    pub fn turn_end(
        session_id: impl Into<String>,
        round: usize,
        status: TurnStatus,
        tool_calls_count: usize,
        assistant_message_preview: impl Into<String>,
        tool_results_preview: &[String],
    ) -> Self {
        let mut data = EventData::new();
        data.insert_u64("round", round as u64);
        data.insert_string("status", status.as_str());
        data.insert_u64("tool_calls_count", tool_calls_count as u64);
        data.insert_string("assistant_message_preview", assistant_message_preview);
        data.insert_value(
            "tool_results_preview",
            Value::from(
                tool_results_preview
                    .iter()
                    .map(|preview| Value::String(preview.clone()))
                    .collect::<Vec<_>>(),
            ),
        );
        Self::new(EventKind::TurnEnd, session_id, data)
    }

    pub fn message_start(
        session_id: impl Into<String>,
        role: Role,
        round: usize,
        source: Option<MessageSource>,
    ) -> Self {
        let mut data = EventData::new();
        data.insert_string("role", role.as_str());
        data.insert_u64("round", round as u64);
        if let Some(source) = source {
            data.insert_string("source", source.as_str());
        }
        Self::new(EventKind::MessageStart, session_id, data)
    }

    pub fn message_update(session_id: impl Into<String>, delta: impl Into<String>) -> Self {
        let mut data = EventData::new();
        data.insert_string("role", Role::Assistant.as_str());
        data.insert_string("delta", delta);
        Self::new(EventKind::MessageUpdate, session_id, data)
    }

    pub fn message_end(
        session_id: impl Into<String>,
        role: Role,
        round: usize,
        text_preview: impl Into<String>,
        source: Option<MessageSource>,
    ) -> Self {
        let mut data = EventData::new();
        data.insert_string("role", role.as_str());
        data.insert_u64("round", round as u64);
        data.insert_string("text_preview", text_preview);
        if let Some(source) = source {
            data.insert_string("source", source.as_str());
        }
        Self::new(EventKind::MessageEnd, session_id, data)
    }

    pub fn tool_execution_start(
        session_id: impl Into<String>,
        round: usize,
        call: &ToolCall,
    ) -> Self {
        let mut data = EventData::new();
        data.insert_u64("round", round as u64);
        data.insert_string("tool_call_id", call.id.clone());
        data.insert_string("tool_name", call.name.clone());
        data.insert_string("args", call.arguments.clone());
        Self::new(EventKind::ToolExecutionStart, session_id, data)
    }

    pub fn tool_execution_update(
        session_id: impl Into<String>,
        round: usize,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        partial: impl Into<String>,
    ) -> Self {
        let mut data = EventData::new();
        data.insert_u64("round", round as u64);
        data.insert_string("tool_call_id", call_id);
        data.insert_string("tool_name", tool_name);
        data.insert_string("partial", partial);
        Self::new(EventKind::ToolExecutionUpdate, session_id, data)
    }

    pub fn tool_execution_end(
        session_id: impl Into<String>,
        round: usize,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result_preview: impl Into<String>,
        skipped: bool,
        details: Option<Value>,
    ) -> Self {
        let mut data = EventData::new();
        data.insert_u64("round", round as u64);
        data.insert_string("tool_call_id", call_id);
        data.insert_string("tool_name", tool_name);
        data.insert_string("result_preview", result_preview);
        if skipped {
            data.insert_bool("skipped", true);
        }
        if let Some(details) = details {
            data.insert_value("details", details);
        }
        Self::new(EventKind::ToolExecutionEnd, session_id, data)
    }

    pub fn lane_wait(session_id: impl Into<String>, wait_ms: u64, run_ms: u64) -> Self {
        let mut data = EventData::new();
        data.insert_u64("wait_ms", wait_ms);
        data.insert_u64("run_ms", run_ms);
        Self::new(EventKind::LaneWait, session_id, data)
    }

    pub fn warning(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = EventData::new();
        data.insert_string("message", message);
        Self::new(EventKind::Warning, session_id, data)
    }
}

/// Per-agent event sink. Implementations must be non-blocking; each single
/// run's events arrive from one worker, in order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

#[derive(Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: AgentEvent) {}
}

/// Adapts a plain callback into a sink. Panics raised by the callback are
/// contained so a misbehaving consumer cannot abort the run.
pub struct CallbackEventSink {
    callback: Arc<dyn Fn(&AgentEvent) + Send + Sync>,
}

impl CallbackEventSink {
    pub fn new(callback: impl Fn(&AgentEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl EventSink for CallbackEventSink {
    fn emit(&self, event: AgentEvent) {
        let callback = self.callback.clone();
        let _ = catch_unwind(AssertUnwindSafe(|| callback(&event)));
    }
}

/// Records every emitted event; used by tests and by consumers that read a
/// run's event history after the fact.
#[derive(Clone, Default)]
pub struct BufferedEventSink {
    inner: Arc<Mutex<Vec<AgentEvent>>>,
}

impl BufferedEventSink {
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.inner.lock().expect("buffered sink mutex poisoned").clone()
    }
}

impl EventSink for BufferedEventSink {
    fn emit(&self, event: AgentEvent) {
        self.inner
            .lock()
            .expect("buffered sink mutex poisoned")
            .push(event);
    }
}
