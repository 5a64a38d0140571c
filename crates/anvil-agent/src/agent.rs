use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use anvil_llm::{
    ChatMessage, CompletionRequest, MessageSource, Provider, ProviderError, ProviderResponse,
    Role, TextDeltaSink, ToolCall, ToolDefinition,
};

use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::errors::{AgentError, SessionError, ToolError};
use crate::events::{AgentEvent, EventSink, NoopEventSink, TurnStatus};
use crate::lanes::LaneQueue;
use crate::prompt::{merge_tool_definitions, tool_summaries, PromptBuilder};
use crate::steering::{CancelToken, SteeringController};
use crate::store::{last_role, utc_now_iso, SessionSeed, SessionSnapshot, SessionStore};
use crate::subagents::{RunEventTail, RunState, SubagentRegistry, SubagentRun};
use crate::tools::{
    error_output, optional_bool_argument, optional_string_argument, orchestration_tool_definitions,
    required_string_argument, truncate_tool_result, RegisteredTool, ToolContext, ToolOutput,
    ToolRegistry, SESSIONS_SPAWN_TOOL, SUBAGENTS_TOOL,
};

/// Result text appended for tool calls abandoned by a steer interrupt.
pub const SKIPPED_DUE_TO_STEER: &str = "Skipped due to user interrupt.";

const PREVIEW_CHARS: usize = 200;

pub type ContextTransformer = Arc<dyn Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync>;
pub type MessageConverter = Arc<dyn Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync>;
pub type BeforeTurnHook = Arc<dyn Fn(TurnContext) -> TurnContext + Send + Sync>;
pub type ApiKeyResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Everything `before_turn` may replace for one round.
#[derive(Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub round: usize,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Default)]
pub struct AgentHooks {
    /// Runs on the prepared context view, after compaction has been
    /// persisted against the stored history.
    pub transform_context: Option<ContextTransformer>,
    /// Runs on the final message list just before the provider call.
    pub convert_to_llm: Option<MessageConverter>,
    /// May replace the prompt, descriptors, and messages for one round.
    pub before_turn: Option<BeforeTurnHook>,
    /// Per-turn dynamic credentials, keyed by provider name.
    pub get_api_key: Option<ApiKeyResolver>,
}

/// Process-wide facilities shared by every agent (and subagent) of one
/// deployment: the session store, the lane scheduler, and the subagent
/// registry.
#[derive(Clone)]
pub struct AgentRuntime {
    store: Arc<SessionStore>,
    lanes: Arc<LaneQueue>,
    subagents: Arc<SubagentRegistry>,
}

impl AgentRuntime {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        Ok(Self {
            store: Arc::new(SessionStore::new(&config.sessions_dir)?),
            lanes: Arc::new(LaneQueue::new(config.max_concurrent)),
            subagents: SubagentRegistry::new(&config.subagents),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn lanes(&self) -> &Arc<LaneQueue> {
        &self.lanes
    }

    pub fn subagents(&self) -> &Arc<SubagentRegistry> {
        &self.subagents
    }
}

pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    config: AgentConfig,
    runtime: Option<AgentRuntime>,
    session_id: Option<String>,
    parent_session_id: Option<String>,
    subagent_depth: usize,
    events: Arc<dyn EventSink>,
    hooks: AgentHooks,
    extra_tools: Vec<RegisteredTool>,
    role_block: Option<String>,
    steering: Option<Arc<SteeringController>>,
}

impl AgentBuilder {
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Share the store, lanes, and subagent registry with other agents.
    pub fn runtime(mut self, runtime: AgentRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn parent_session(mut self, parent_session_id: impl Into<String>, depth: usize) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self.subagent_depth = depth;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn hooks(mut self, hooks: AgentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register a caller-supplied tool (schema + handler). On a name
    /// collision with a built-in, the extra tool wins.
    pub fn extra_tool(mut self, tool: RegisteredTool) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn role_block(mut self, role_block: impl Into<String>) -> Self {
        self.role_block = Some(role_block.into());
        self
    }

    /// Use an externally held steering controller (for supervisors that
    /// steer or cancel the agent from another task).
    pub fn steering(mut self, steering: Arc<SteeringController>) -> Self {
        self.steering = Some(steering);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        if self.config.provider.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "provider must be non-empty".to_string(),
            )
            .into());
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => AgentRuntime::new(&self.config)?,
        };
        let session_id = SessionStore::resolve_session_id(self.session_id.as_deref());
        runtime.store.open(
            &session_id,
            &SessionSeed {
                provider: self.config.provider.clone(),
                model: self.config.model.clone(),
                workspace_dir: self.config.workspace_dir.display().to_string(),
                parent_session_id: self.parent_session_id.clone(),
                subagent_depth: self.subagent_depth,
            },
        )?;

        let mut tools = ToolRegistry::builtins();
        let mut tool_collisions = Vec::new();
        for tool in self.extra_tools {
            if tools.contains(&tool.definition.name) {
                tool_collisions.push(tool.definition.name.clone());
            }
            tools.register(tool);
        }

        // Descriptor union for the provider. Caller-supplied tools are the
        // winning side of every collision, including against the
        // orchestration built-ins; collided names surface as warnings.
        let (tool_definitions, orchestration_collisions) = if self.config.enable_orchestration {
            merge_tool_definitions(orchestration_tool_definitions(), &tools.definitions())
        } else {
            (tools.definitions(), Vec::new())
        };
        tool_collisions.extend(orchestration_collisions);

        let prompt_builder =
            PromptBuilder::new(self.config.max_tool_result_chars).with_role_block(self.role_block);
        let context = ContextManager::new(self.config.context.clone());

        Ok(Agent {
            provider: self.provider,
            context,
            prompt_builder,
            tools,
            tool_definitions,
            tool_collisions,
            steering: self.steering.unwrap_or_default(),
            events: self.events,
            hooks: self.hooks,
            session_id,
            subagent_depth: self.subagent_depth,
            runtime,
            config: self.config,
        })
    }
}

/// A reactive agent bound to one session. Turns are serialized through the
/// runtime's lane queue; steering, follow-up, and cancellation arrive
/// through the shared `SteeringController` at any time.
pub struct Agent {
    config: AgentConfig,
    runtime: AgentRuntime,
    provider: Arc<dyn Provider>,
    context: ContextManager,
    prompt_builder: PromptBuilder,
    tools: ToolRegistry,
    /// Descriptor union sent to the provider, fixed at build time.
    tool_definitions: Vec<ToolDefinition>,
    tool_collisions: Vec<String>,
    steering: Arc<SteeringController>,
    events: Arc<dyn EventSink>,
    hooks: AgentHooks,
    session_id: String,
    subagent_depth: usize,
}

impl Agent {
    pub fn builder(provider: Arc<dyn Provider>) -> AgentBuilder {
        AgentBuilder {
            provider,
            config: AgentConfig::default(),
            runtime: None,
            session_id: None,
            parent_session_id: None,
            subagent_depth: 0,
            events: Arc::new(NoopEventSink),
            hooks: AgentHooks::default(),
            extra_tools: Vec::new(),
            role_block: None,
            steering: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn steering(&self) -> Arc<SteeringController> {
        self.steering.clone()
    }

    pub fn steer(&self, message: impl Into<String>) {
        self.steering.steer(message);
    }

    pub fn follow_up(&self, message: impl Into<String>) {
        self.steering.follow_up(message);
    }

    pub fn clear_steering_queue(&self) {
        self.steering.clear_steering_queue();
    }

    pub fn clear_follow_up_queue(&self) {
        self.steering.clear_follow_up_queue();
    }

    pub fn clear_all_queues(&self) {
        self.steering.clear_all_queues();
    }

    pub fn cancel(&self) {
        self.steering.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.steering.cancel_token()
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, AgentError> {
        Ok(self.runtime.store.snapshot(&self.session_id)?)
    }

    /// Clear the conversation history, keeping the session header.
    pub fn reset(&self) -> Result<(), AgentError> {
        Ok(self.runtime.store.reset(&self.session_id)?)
    }

    pub async fn chat(&self, user_input: &str) -> Result<String, AgentError> {
        self.submit(Some(user_input.to_string()), None).await
    }

    pub async fn chat_stream(
        &self,
        user_input: &str,
        on_text_delta: TextDeltaSink,
    ) -> Result<String, AgentError> {
        self.submit(Some(user_input.to_string()), Some(on_text_delta))
            .await
    }

    /// Re-enter the loop without appending a new user message. The session's
    /// last message must have role `user` or `tool`.
    pub async fn continue_run(&self) -> Result<String, AgentError> {
        self.submit(None, None).await
    }

    pub async fn continue_run_stream(
        &self,
        on_text_delta: TextDeltaSink,
    ) -> Result<String, AgentError> {
        self.submit(None, Some(on_text_delta)).await
    }

    async fn submit(
        &self,
        user_input: Option<String>,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<String, AgentError> {
        let (result, metrics) = self
            .runtime
            .lanes
            .run(&self.session_id, self.run_in_lane(user_input, on_text_delta))
            .await;
        if metrics.wait_ms >= self.config.lane_warn_wait_ms {
            self.emit(AgentEvent::lane_wait(
                self.session_id.clone(),
                metrics.wait_ms,
                metrics.run_ms,
            ));
            self.runtime.store.add_system_note(
                &self.session_id,
                &format!(
                    "Lane wait detected: waited={}ms run={}ms session={}",
                    metrics.wait_ms, metrics.run_ms, self.session_id
                ),
            )?;
        }
        result
    }

    async fn run_in_lane(
        &self,
        user_input: Option<String>,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<String, AgentError> {
        if user_input.is_none() {
            let snapshot = self.runtime.store.snapshot(&self.session_id)?;
            if snapshot.messages.is_empty() {
                return Err(
                    SessionError::CannotContinue("no messages in context".to_string()).into(),
                );
            }
            match last_role(&snapshot.messages) {
                Some(Role::User) | Some(Role::Tool) => {}
                _ => {
                    return Err(SessionError::CannotContinue(
                        "last message must be user or tool".to_string(),
                    )
                    .into());
                }
            }
        }
        let result = self.run_loop(user_input, on_text_delta).await;
        if let Err(AgentError::Storage(error)) = &result {
            // Storage failures abort mid-round; still close the stream.
            self.emit(AgentEvent::agent_end(
                self.session_id.clone(),
                format!("(agent stopped: {error})"),
            ));
        }
        result
    }

    async fn run_loop(
        &self,
        mut pending_user: Option<String>,
        on_text_delta: Option<TextDeltaSink>,
    ) -> Result<String, AgentError> {
        let cancel = self.steering.cancel_token();
        self.emit(AgentEvent::agent_start(self.session_id.clone()));
        for name in &self.tool_collisions {
            self.emit(AgentEvent::warning(
                self.session_id.clone(),
                format!("extra tool '{name}' overrides a built-in tool of the same name"),
            ));
        }

        let delta_sink: Option<TextDeltaSink> = on_text_delta.map(|on_delta| {
            let events = self.events.clone();
            let session_id = self.session_id.clone();
            Arc::new(move |delta: &str| {
                if delta.is_empty() {
                    return;
                }
                on_delta(delta);
                events.emit(AgentEvent::message_update(session_id.clone(), delta));
            }) as TextDeltaSink
        });

        let mut last_signature = String::new();
        let mut repeat_rounds = 0usize;

        for round in 1..=self.config.max_tool_rounds {
            self.emit(AgentEvent::turn_start(self.session_id.clone(), round));
            if cancel.is_cancelled() {
                self.emit_turn_end(round, TurnStatus::Cancelled, 0, "", &[]);
                return self.finish_run("(agent stopped: cancelled)");
            }

            if let Some(input) = pending_user.take() {
                self.append_user_message(round, &input, None)?;
            }

            // The context view is computed from the stored history so the
            // compaction indices stay valid for `replace_prefix`; hooks see
            // the compacted view afterwards.
            let snapshot = self.runtime.store.snapshot(&self.session_id)?;
            let view = self.context.prepare(&snapshot.messages);
            if let Some(plan) = &view.compaction {
                self.runtime.store.replace_prefix(
                    &self.session_id,
                    plan.replace_up_to,
                    plan.summary.clone(),
                )?;
            }
            let mut messages = view.messages;
            if let Some(transform) = &self.hooks.transform_context {
                messages = transform(messages);
            }

            let definitions = self.tool_definitions.clone();
            let today = utc_now_iso()[..10].to_string();
            let system_prompt = self.prompt_builder.build(
                &self.config.provider,
                &self.config.model,
                &self.config.workspace_dir,
                &tool_summaries(&definitions),
                &today,
            );

            let mut turn = TurnContext {
                session_id: self.session_id.clone(),
                round,
                system_prompt,
                tools: definitions,
                messages,
            };
            if let Some(before_turn) = &self.hooks.before_turn {
                turn = before_turn(turn);
            }

            let mut llm_messages = Vec::with_capacity(turn.messages.len() + 1);
            llm_messages.push(ChatMessage::system(turn.system_prompt));
            llm_messages.extend(turn.messages);
            if let Some(convert) = &self.hooks.convert_to_llm {
                llm_messages = convert(llm_messages);
            }

            self.emit(AgentEvent::message_start(
                self.session_id.clone(),
                Role::Assistant,
                round,
                None,
            ));
            let response = match self
                .complete_with_retry(llm_messages, turn.tools, delta_sink.clone(), &cancel)
                .await
            {
                Ok(response) => response,
                Err(CallFailure::Cancelled) => {
                    self.emit(AgentEvent::message_end(
                        self.session_id.clone(),
                        Role::Assistant,
                        round,
                        "",
                        None,
                    ));
                    self.emit_turn_end(round, TurnStatus::Cancelled, 0, "", &[]);
                    return self.finish_run("(agent stopped: cancelled)");
                }
                Err(CallFailure::Provider(error)) => {
                    self.emit(AgentEvent::message_end(
                        self.session_id.clone(),
                        Role::Assistant,
                        round,
                        "",
                        None,
                    ));
                    self.emit_turn_end(round, TurnStatus::Failed, 0, "", &[]);
                    self.emit(AgentEvent::agent_end(
                        self.session_id.clone(),
                        format!("(agent stopped: {error})"),
                    ));
                    return Err(error.into());
                }
            };

            let assistant_preview = preview(response.text(), PREVIEW_CHARS);
            self.emit(AgentEvent::message_end(
                self.session_id.clone(),
                Role::Assistant,
                round,
                assistant_preview.clone(),
                None,
            ));
            self.runtime.store.append(
                &self.session_id,
                response.message.clone().with_created_at(utc_now_iso()),
            )?;
            if let Some(usage) = response.usage {
                self.runtime
                    .store
                    .update_header(&self.session_id, |header| {
                        header.accumulate_usage(&usage);
                    })?;
            }

            let tool_calls = response.tool_calls().to_vec();
            if tool_calls.is_empty() {
                if let Some(follow_up) = self.steering.pop_follow_up_message() {
                    self.append_user_message(round, &follow_up, Some(MessageSource::FollowUp))?;
                    self.emit_turn_end(
                        round,
                        TurnStatus::FollowUpInjected,
                        0,
                        &assistant_preview,
                        &[],
                    );
                    continue;
                }
                self.emit_turn_end(round, TurnStatus::Completed, 0, &assistant_preview, &[]);
                return self.finish_run(response.text());
            }

            let signature = round_signature(response.text(), &tool_calls);
            if signature == last_signature {
                repeat_rounds += 1;
            } else {
                repeat_rounds = 1;
                last_signature = signature;
            }
            if repeat_rounds >= 3 {
                self.emit_turn_end(
                    round,
                    TurnStatus::LoopDetected,
                    tool_calls.len(),
                    &assistant_preview,
                    &[],
                );
                return self.finish_run("(agent stopped: repeated tool-call loop detected)");
            }

            let mut tool_results_preview = Vec::new();
            let mut steering_triggered = false;
            for (index, call) in tool_calls.iter().enumerate() {
                // Safe point: a pending steer abandons this and every
                // following call in the batch.
                if let Some(steer_text) = self.steering.pop_steering_message() {
                    self.skip_remaining_calls(round, &tool_calls[index..], &mut tool_results_preview)?;
                    self.append_user_message(round, &steer_text, Some(MessageSource::Steer))?;
                    steering_triggered = true;
                    break;
                }
                if cancel.is_cancelled() {
                    self.emit_turn_end(
                        round,
                        TurnStatus::Cancelled,
                        tool_calls.len(),
                        &assistant_preview,
                        &tool_results_preview,
                    );
                    return self.finish_run("(agent stopped: cancelled)");
                }

                self.emit(AgentEvent::tool_execution_start(
                    self.session_id.clone(),
                    round,
                    call,
                ));
                let output = self.execute_tool_call(round, call, &cancel).await;
                let truncated =
                    truncate_tool_result(&output.text, self.config.max_tool_result_chars);
                let result_preview = preview(&truncated, PREVIEW_CHARS);
                tool_results_preview.push(result_preview.clone());
                self.runtime.store.append(
                    &self.session_id,
                    ChatMessage::tool_result(call.id.clone(), Some(call.name.clone()), truncated)
                        .with_created_at(utc_now_iso()),
                )?;
                self.emit(AgentEvent::tool_execution_end(
                    self.session_id.clone(),
                    round,
                    call.id.clone(),
                    call.name.clone(),
                    result_preview,
                    false,
                    output.details.clone(),
                ));
            }

            let status = if steering_triggered {
                TurnStatus::Steered
            } else {
                TurnStatus::ToolCallsProcessed
            };
            self.emit_turn_end(
                round,
                status,
                tool_calls.len(),
                &assistant_preview,
                &tool_results_preview,
            );
        }

        self.finish_run("(agent stopped: too many tool rounds)")
    }

    async fn execute_tool_call(
        &self,
        round: usize,
        call: &ToolCall,
        cancel: &CancelToken,
    ) -> ToolOutput {
        // A caller-supplied tool that won the name collision also wins
        // dispatch; only unshadowed orchestration names are intercepted.
        if self.config.enable_orchestration
            && (call.name == SESSIONS_SPAWN_TOOL || call.name == SUBAGENTS_TOOL)
            && !self.tools.contains(&call.name)
        {
            return self.execute_orchestration_call(call).await;
        }

        let events = self.events.clone();
        let session_id = self.session_id.clone();
        let call_id = call.id.clone();
        let call_name = call.name.clone();
        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            workspace_dir: self.config.workspace_dir.clone(),
            cancel: cancel.clone(),
            on_progress: Some(Arc::new(move |text: &str| {
                events.emit(AgentEvent::tool_execution_update(
                    session_id.clone(),
                    round,
                    call_id.clone(),
                    call_name.clone(),
                    text,
                ));
            })),
        };
        self.tools.dispatch(&call.name, &call.arguments, ctx).await
    }

    async fn execute_orchestration_call(&self, call: &ToolCall) -> ToolOutput {
        let arguments: Value = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(value) => value,
                Err(error) => {
                    return error_output(
                        &call.name,
                        format!("failed to parse tool arguments: {error}"),
                    );
                }
            }
        };
        let handled = match call.name.as_str() {
            SESSIONS_SPAWN_TOOL => self.handle_sessions_spawn(arguments).await,
            _ => self.handle_subagents(arguments).await,
        };
        match handled {
            Ok(text) => ToolOutput::text(text),
            Err(error) => error_output(&call.name, error.to_string()),
        }
    }

    async fn handle_sessions_spawn(&self, arguments: Value) -> Result<String, ToolError> {
        let task = required_string_argument(&arguments, "task")?;
        let run_now = optional_bool_argument(&arguments, "run_now")?.unwrap_or(true);
        let background = optional_bool_argument(&arguments, "background")?.unwrap_or(true);
        let provider_name = optional_string_argument(&arguments, "provider")?
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.config.provider.clone());
        let model = optional_string_argument(&arguments, "model")?
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.config.model.clone());

        let depth = self.subagent_depth;
        let max_depth = self.config.subagents.max_depth;
        if depth + 1 > max_depth {
            return Ok(json!({
                "status": "error",
                "error": format!("depth_exceeded: subagent depth limit reached ({depth}/{max_depth})"),
            })
            .to_string());
        }

        let run_id = format!("subrun-{}", short_id());
        let child_session_id = format!("subsess-{}", short_id());
        let run = SubagentRun {
            run_id: run_id.clone(),
            session_id: child_session_id.clone(),
            parent_session_id: self.session_id.clone(),
            depth: depth + 1,
            task: task.clone(),
            provider: provider_name.clone(),
            model: model.clone(),
            state: RunState::Queued,
            created_at: utc_now_iso(),
            started_at: None,
            finished_at: None,
            final_text: None,
            error: None,
        };
        let steering = Arc::new(SteeringController::new());
        self.runtime.subagents.register(run, steering.clone());
        self.runtime
            .store
            .add_system_note(
                &self.session_id,
                &format!(
                    "Spawned subagent run={run_id} child_session={child_session_id} depth={}",
                    depth + 1
                ),
            )
            .map_err(|error| ToolError::Execution(error.to_string()))?;

        let mut payload = json!({
            "status": "ok",
            "run_id": run_id,
            "child_session_id": child_session_id,
            "provider": provider_name,
            "model": model,
            "depth": depth + 1,
        });

        if run_now {
            if background {
                self.dispatch_subagent_run(
                    &run_id,
                    &child_session_id,
                    &provider_name,
                    &model,
                    &task,
                    steering,
                );
                payload["dispatched"] = Value::String("background".to_string());
            } else {
                let child = self
                    .build_child_agent(&child_session_id, &provider_name, &model, steering)
                    .map_err(|error| ToolError::Execution(error.to_string()))?;
                self.runtime.subagents.set_running(&run_id);
                // Boxed: the child loop re-enters this loop's future type.
                match Box::pin(child.chat(&task)).await {
                    Ok(reply) => {
                        self.runtime.subagents.set_completed(&run_id, &reply);
                        payload["first_reply"] = Value::String(preview(&reply, 1_200));
                        self.runtime
                            .store
                            .add_system_note(
                                &self.session_id,
                                &format!("Subagent run={run_id} completed initial task."),
                            )
                            .map_err(|error| ToolError::Execution(error.to_string()))?;
                    }
                    Err(error) => {
                        self.runtime
                            .subagents
                            .set_failed(&run_id, &error.to_string());
                        return Err(ToolError::Execution(error.to_string()));
                    }
                }
            }
        }
        Ok(payload.to_string())
    }

    async fn handle_subagents(&self, arguments: Value) -> Result<String, ToolError> {
        let action = required_string_argument(&arguments, "action")?
            .trim()
            .to_lowercase();
        let registry = self.runtime.subagents.clone();

        if action == "list" {
            let rows: Vec<Value> = registry
                .list(&self.session_id)
                .into_iter()
                .map(|run| {
                    json!({
                        "run_id": run.run_id,
                        "child_session_id": run.session_id,
                        "state": run.state.as_str(),
                        "depth": run.depth,
                        "task": preview(&run.task, 120),
                        "created_at": run.created_at,
                        "provider": run.provider,
                        "model": run.model,
                        "final_text": run.final_text.as_deref().map(|text| preview(text, 180)),
                        "error": run.error.as_deref().map(|text| preview(text, 180)),
                        "is_running_now": registry.is_running(&run.run_id),
                    })
                })
                .collect();
            return Ok(json!({"status": "ok", "runs": rows}).to_string());
        }

        let Some(run_id) = optional_string_argument(&arguments, "run_id")? else {
            return Ok(
                json!({"status": "error", "error": "run_id is required for this action"})
                    .to_string(),
            );
        };
        let Some(run) = registry.get(&run_id) else {
            return Ok(
                json!({"status": "error", "error": format!("run not found: {run_id}")}).to_string(),
            );
        };
        if run.parent_session_id != self.session_id {
            return Ok(json!({
                "status": "error",
                "error": "run does not belong to this session",
            })
            .to_string());
        }

        match action.as_str() {
            "get_result" => Ok(json!({
                "status": "ok",
                "run_id": run.run_id,
                "state": run.state.as_str(),
                "reply": run.final_text,
                "error": run.error,
                "is_running_now": registry.is_running(&run.run_id),
            })
            .to_string()),
            "events" => {
                let events = registry.events(&run.run_id).unwrap_or_default();
                Ok(json!({
                    "status": "ok",
                    "run_id": run.run_id,
                    "state": run.state.as_str(),
                    "events": events,
                })
                .to_string())
            }
            "kill" => {
                let state = registry.kill(&run.run_id).unwrap_or(RunState::Cancelled);
                self.runtime
                    .store
                    .add_system_note(
                        &self.session_id,
                        &format!("Subagent run={run_id} marked as cancelled."),
                    )
                    .map_err(|error| ToolError::Execution(error.to_string()))?;
                Ok(json!({
                    "status": "ok",
                    "run_id": run_id,
                    "state": state.as_str(),
                })
                .to_string())
            }
            "steer" => {
                let Some(message) = optional_string_argument(&arguments, "message")?
                    .map(|message| message.trim().to_string())
                    .filter(|message| !message.is_empty())
                else {
                    return Ok(json!({
                        "status": "error",
                        "error": "message is required for steer",
                    })
                    .to_string());
                };
                match run.state {
                    RunState::Cancelled | RunState::TimedOut => Ok(json!({
                        "status": "error",
                        "error": format!("run is not active: {}", run.state.as_str()),
                    })
                    .to_string()),
                    RunState::Queued | RunState::Running => {
                        if let Some(steering) = registry.steering(&run.run_id) {
                            steering.steer(message);
                        }
                        Ok(json!({
                            "status": "ok",
                            "run_id": run_id,
                            "delivered": "steering_queue",
                        })
                        .to_string())
                    }
                    RunState::Completed | RunState::Failed => {
                        registry.reopen(&run.run_id, &message);
                        let steering = registry
                            .steering(&run.run_id)
                            .unwrap_or_else(|| Arc::new(SteeringController::new()));
                        self.dispatch_subagent_run(
                            &run.run_id,
                            &run.session_id,
                            &run.provider,
                            &run.model,
                            &message,
                            steering,
                        );
                        self.runtime
                            .store
                            .add_system_note(
                                &self.session_id,
                                &format!("Subagent run={run_id} steered with a new message."),
                            )
                            .map_err(|error| ToolError::Execution(error.to_string()))?;
                        Ok(json!({
                            "status": "ok",
                            "run_id": run_id,
                            "dispatched": "background",
                        })
                        .to_string())
                    }
                }
            }
            other => Ok(json!({
                "status": "error",
                "error": format!("unknown action: {other}"),
            })
            .to_string()),
        }
    }

    fn build_child_agent(
        &self,
        child_session_id: &str,
        provider_name: &str,
        model: &str,
        steering: Arc<SteeringController>,
    ) -> Result<Agent, AgentError> {
        let mut child_config = self.config.clone();
        child_config.provider = provider_name.to_string();
        child_config.model = model.to_string();
        Agent::builder(self.provider.clone())
            .config(child_config)
            .runtime(self.runtime.clone())
            .session_id(child_session_id)
            .parent_session(self.session_id.clone(), self.subagent_depth + 1)
            .event_sink(Arc::new(RunEventTail::new(
                self.runtime.subagents.clone(),
                child_session_id,
            )))
            .steering(steering)
            .build()
    }

    /// Run (or continue) a subagent in the background under the worker pool.
    fn dispatch_subagent_run(
        &self,
        run_id: &str,
        child_session_id: &str,
        provider_name: &str,
        model: &str,
        input: &str,
        steering: Arc<SteeringController>,
    ) {
        let registry = self.runtime.subagents.clone();
        let runtime = self.runtime.clone();
        let store = self.runtime.store.clone();
        let provider = self.provider.clone();
        let mut child_config = self.config.clone();
        child_config.provider = provider_name.to_string();
        child_config.model = model.to_string();
        let parent_session_id = self.session_id.clone();
        let depth = self.subagent_depth + 1;
        let announce = self.config.subagents.announce_completion;
        let timeout_seconds = self.config.subagents.run_timeout_seconds;
        let run_id_owned = run_id.to_string();
        let child_session_id = child_session_id.to_string();
        let input = input.to_string();

        let work_run_id = run_id_owned.clone();
        self.runtime.subagents.submit(run_id, async move {
            let run_id = work_run_id;
            let workers = registry.workers();
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            registry.set_running(&run_id);

            let tail: Arc<dyn EventSink> =
                Arc::new(RunEventTail::new(registry.clone(), run_id.clone()));
            let child = Agent::builder(provider)
                .config(child_config)
                .runtime(runtime)
                .session_id(child_session_id)
                .parent_session(parent_session_id.clone(), depth)
                .event_sink(tail)
                .steering(steering)
                .build();
            let child = match child {
                Ok(child) => child,
                Err(error) => {
                    registry.set_failed(&run_id, &error.to_string());
                    let _ = store.add_system_note(
                        &parent_session_id,
                        &format!("Subagent run={run_id} failed to start: {error}"),
                    );
                    return;
                }
            };

            let cancel = child.cancel_token();
            let chat = Box::pin(child.chat(&input));
            let outcome = if timeout_seconds > 0 {
                match tokio::time::timeout(Duration::from_secs(timeout_seconds), chat).await {
                    Ok(result) => Some(result),
                    Err(_elapsed) => None,
                }
            } else {
                Some(chat.await)
            };

            match outcome {
                None => {
                    cancel.cancel();
                    registry.set_timed_out(&run_id);
                    let _ = store.add_system_note(
                        &parent_session_id,
                        &format!("Subagent run={run_id} timed out."),
                    );
                }
                Some(Ok(reply)) => {
                    if cancel.is_cancelled() {
                        registry.set_cancelled(&run_id);
                        let _ = store.add_system_note(
                            &parent_session_id,
                            &format!("Subagent run={run_id} cancelled before completion."),
                        );
                    } else {
                        registry.set_completed(&run_id, &reply);
                        let _ = store.add_system_note(
                            &parent_session_id,
                            &format!("Subagent run={run_id} completed in background."),
                        );
                        if announce && !reply.trim().is_empty() {
                            let summary = preview(reply.trim(), 400);
                            let _ = store.append(
                                &parent_session_id,
                                ChatMessage::assistant(format!(
                                    "Subagent run={run_id} completed: {summary}"
                                ))
                                .with_created_at(utc_now_iso()),
                            );
                        }
                    }
                }
                Some(Err(error)) => {
                    registry.set_failed(&run_id, &error.to_string());
                    let _ = store.add_system_note(
                        &parent_session_id,
                        &format!(
                            "Subagent run={run_id} failed in background: {}",
                            preview(&error.to_string(), 200)
                        ),
                    );
                }
            }
        });
    }

    async fn complete_with_retry(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        on_text_delta: Option<TextDeltaSink>,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse, CallFailure> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CallFailure::Cancelled);
            }
            let api_key = self
                .hooks
                .get_api_key
                .as_ref()
                .and_then(|resolve| resolve(&self.config.provider));
            let request = CompletionRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                session_id: Some(self.session_id.clone()),
                api_key,
            };

            let call = self.provider.complete(request, on_text_delta.clone());
            tokio::pin!(call);
            let result = tokio::select! {
                result = &mut call => result,
                _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_seconds * 2f64.powi(attempt as i32);
                    let sleep = tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0)));
                    tokio::pin!(sleep);
                    tokio::select! {
                        _ = &mut sleep => {}
                        _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
                    }
                    attempt += 1;
                }
                Err(error) => return Err(CallFailure::Provider(error)),
            }
        }
    }

    fn skip_remaining_calls(
        &self,
        round: usize,
        calls: &[ToolCall],
        tool_results_preview: &mut Vec<String>,
    ) -> Result<(), AgentError> {
        for call in calls {
            self.emit(AgentEvent::tool_execution_start(
                self.session_id.clone(),
                round,
                call,
            ));
            let skipped_preview = preview(SKIPPED_DUE_TO_STEER, PREVIEW_CHARS);
            tool_results_preview.push(skipped_preview.clone());
            self.runtime.store.append(
                &self.session_id,
                ChatMessage::tool_result(
                    call.id.clone(),
                    Some(call.name.clone()),
                    SKIPPED_DUE_TO_STEER,
                )
                .with_source(MessageSource::Skipped)
                .with_created_at(utc_now_iso()),
            )?;
            self.emit(AgentEvent::tool_execution_end(
                self.session_id.clone(),
                round,
                call.id.clone(),
                call.name.clone(),
                skipped_preview,
                true,
                None,
            ));
        }
        Ok(())
    }

    fn append_user_message(
        &self,
        round: usize,
        content: &str,
        source: Option<MessageSource>,
    ) -> Result<(), AgentError> {
        self.emit(AgentEvent::message_start(
            self.session_id.clone(),
            Role::User,
            round,
            source,
        ));
        let mut message = ChatMessage::user(content).with_created_at(utc_now_iso());
        message.source = source;
        self.runtime.store.append(&self.session_id, message)?;
        self.emit(AgentEvent::message_end(
            self.session_id.clone(),
            Role::User,
            round,
            preview(content, PREVIEW_CHARS),
            source,
        ));
        Ok(())
    }

    fn emit_turn_end(
        &self,
        round: usize,
        status: TurnStatus,
        tool_calls_count: usize,
        assistant_message_preview: &str,
        tool_results_preview: &[String],
    ) {
        self.emit(AgentEvent::turn_end(
            self.session_id.clone(),
            round,
            status,
            tool_calls_count,
            assistant_message_preview,
            tool_results_preview,
        ));
    }

    fn finish_run(&self, final_text: &str) -> Result<String, AgentError> {
        self.emit(AgentEvent::agent_end(self.session_id.clone(), final_text));
        Ok(final_text.to_string())
    }

    fn emit(&self, event: AgentEvent) {
        self.events.emit(event);
    }
}

enum CallFailure {
    Cancelled,
    Provider(ProviderError),
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Char-safe preview with a trailing ellipsis, used for event payloads.
pub fn preview(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let head: String = text.chars().take(max_len.saturating_sub(3)).collect();
    format!("{head}...")
}

/// Canonical `(name, arguments)` tuple for the loop guard. Arguments are
/// re-serialized through `serde_json::Value` so key order is stable.
fn round_signature(assistant_text: &str, calls: &[ToolCall]) -> String {
    let call_part: Vec<String> = calls
        .iter()
        .map(|call| {
            let canonical = serde_json::from_str::<Value>(&call.arguments)
                .map(|value| value.to_string())
                .unwrap_or_else(|_| call.arguments.clone());
            format!("{}:{}", call.name, canonical)
        })
        .collect();
    format!("{assistant_text}\u{1}{}", call_part.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_with_ellipsis() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn round_signature_is_stable_across_key_order() {
        let a = vec![ToolCall::new("t", "echo", r#"{"a":1,"b":2}"#)];
        let b = vec![ToolCall::new("t", "echo", r#"{"b":2,"a":1}"#)];
        assert_eq!(round_signature("hi", &a), round_signature("hi", &b));
    }

    #[test]
    fn round_signature_distinguishes_assistant_text() {
        let calls = vec![ToolCall::new("t", "echo", "{}")];
        assert_ne!(
            round_signature("one", &calls),
            round_signature("two", &calls)
        );
    }
}
