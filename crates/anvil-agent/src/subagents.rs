use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::SubagentConfig;
use crate::events::{AgentEvent, EventSink};
use crate::steering::{CancelToken, SteeringController};
use crate::store::utc_now_iso;

/// Subagent run lifecycle: `Queued -> Running -> terminal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// One supervised child run.
#[derive(Clone, Debug, Serialize)]
pub struct SubagentRun {
    pub run_id: String,
    /// Child session id.
    pub session_id: String,
    pub parent_session_id: String,
    pub depth: usize,
    pub task: String,
    pub provider: String,
    pub model: String,
    pub state: RunState,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RunRecord {
    run: SubagentRun,
    cancel: CancelToken,
    steering: Arc<SteeringController>,
    events: VecDeque<AgentEvent>,
    task: Option<JoinHandle<()>>,
}

/// Mutex-guarded global mapping of subagent runs. Owns run records; parents
/// and children reference each other by id only.
pub struct SubagentRegistry {
    runs: Mutex<HashMap<String, RunRecord>>,
    workers: Arc<Semaphore>,
    event_buffer: usize,
}

impl SubagentRegistry {
    pub fn new(config: &SubagentConfig) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            event_buffer: config.event_buffer.max(1),
        })
    }

    /// Background worker pool shared by every run of this registry.
    pub fn workers(&self) -> Arc<Semaphore> {
        self.workers.clone()
    }

    pub fn register(
        &self,
        run: SubagentRun,
        steering: Arc<SteeringController>,
    ) {
        let record = RunRecord {
            cancel: steering.cancel_token(),
            steering,
            events: VecDeque::new(),
            task: None,
            run,
        };
        self.lock_runs().insert(record.run.run_id.clone(), record);
    }

    pub fn list(&self, parent_session_id: &str) -> Vec<SubagentRun> {
        let runs = self.lock_runs();
        let mut result: Vec<SubagentRun> = runs
            .values()
            .filter(|record| record.run.parent_session_id == parent_session_id)
            .map(|record| record.run.clone())
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        result
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.lock_runs().get(run_id).map(|record| record.run.clone())
    }

    pub fn steering(&self, run_id: &str) -> Option<Arc<SteeringController>> {
        self.lock_runs()
            .get(run_id)
            .map(|record| record.steering.clone())
    }

    /// Buffered tail of the run's lifecycle events, oldest first.
    pub fn events(&self, run_id: &str) -> Option<Vec<AgentEvent>> {
        self.lock_runs()
            .get(run_id)
            .map(|record| record.events.iter().cloned().collect())
    }

    pub fn record_event(&self, run_id: &str, event: AgentEvent) {
        let mut runs = self.lock_runs();
        if let Some(record) = runs.get_mut(run_id) {
            if record.events.len() >= self.event_buffer {
                record.events.pop_front();
            }
            record.events.push_back(event);
        }
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.lock_runs()
            .get(run_id)
            .map(|record| {
                record
                    .task
                    .as_ref()
                    .is_some_and(|task| !task.is_finished())
            })
            .unwrap_or(false)
    }

    /// Spawn and track the run's background task. An in-flight task for the
    /// same run is aborted first.
    pub fn submit<F>(&self, run_id: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        let mut runs = self.lock_runs();
        if let Some(record) = runs.get_mut(run_id) {
            if let Some(previous) = record.task.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    pub fn set_running(&self, run_id: &str) -> Option<SubagentRun> {
        self.transition(run_id, |run| {
            if run.state == RunState::Queued {
                run.state = RunState::Running;
                run.started_at = Some(utc_now_iso());
            }
        })
    }

    pub fn set_completed(&self, run_id: &str, final_text: &str) -> Option<SubagentRun> {
        self.finish(run_id, RunState::Completed, Some(final_text), None)
    }

    pub fn set_failed(&self, run_id: &str, error: &str) -> Option<SubagentRun> {
        self.finish(run_id, RunState::Failed, None, Some(error))
    }

    pub fn set_cancelled(&self, run_id: &str) -> Option<SubagentRun> {
        self.finish(run_id, RunState::Cancelled, None, Some("cancelled by request"))
    }

    pub fn set_timed_out(&self, run_id: &str) -> Option<SubagentRun> {
        self.finish(run_id, RunState::TimedOut, None, Some("run timed out"))
    }

    /// Re-arm a finished run for a new input. Killed and timed-out runs stay
    /// terminal.
    pub fn reopen(&self, run_id: &str, task: &str) -> Option<SubagentRun> {
        self.transition(run_id, |run| {
            if matches!(run.state, RunState::Completed | RunState::Failed) {
                run.state = RunState::Queued;
                run.task = task.to_string();
                run.finished_at = None;
                run.error = None;
            }
        })
    }

    /// Idempotent: trips the run's cancellation token, aborts its task, and
    /// reports the resulting state.
    pub fn kill(&self, run_id: &str) -> Option<RunState> {
        let mut runs = self.lock_runs();
        let record = runs.get_mut(run_id)?;
        record.cancel.cancel();
        if let Some(task) = record.task.take() {
            task.abort();
        }
        if !record.run.state.is_terminal() {
            record.run.state = RunState::Cancelled;
            record.run.finished_at = Some(utc_now_iso());
            record.run.error = Some("cancelled by request".to_string());
        }
        Some(record.run.state)
    }

    fn finish(
        &self,
        run_id: &str,
        state: RunState,
        final_text: Option<&str>,
        error: Option<&str>,
    ) -> Option<SubagentRun> {
        self.transition(run_id, |run| {
            // A timed-out or killed run keeps its terminal state.
            if run.state.is_terminal() {
                return;
            }
            run.state = state;
            run.finished_at = Some(utc_now_iso());
            run.final_text = final_text.map(str::to_string);
            run.error = error.map(str::to_string);
        })
    }

    fn transition<F>(&self, run_id: &str, apply: F) -> Option<SubagentRun>
    where
        F: FnOnce(&mut SubagentRun),
    {
        let mut runs = self.lock_runs();
        let record = runs.get_mut(run_id)?;
        apply(&mut record.run);
        Some(record.run.clone())
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunRecord>> {
        self.runs.lock().expect("subagent registry mutex poisoned")
    }
}

/// Sink that buffers a child run's events into the registry's per-run tail.
pub struct RunEventTail {
    registry: Arc<SubagentRegistry>,
    run_id: String,
}

impl RunEventTail {
    pub fn new(registry: Arc<SubagentRegistry>, run_id: impl Into<String>) -> Self {
        Self {
            registry,
            run_id: run_id.into(),
        }
    }
}

impl EventSink for RunEventTail {
    fn emit(&self, event: AgentEvent) {
        self.registry.record_event(&self.run_id, event);
    }
}
