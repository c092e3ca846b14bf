use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vigil_ledger::{CostGuard, ExecutionPhase, LedgerTotals, StepUsage, TokenLedger};
use vigil_recovery::{
    classify_failure, describe_tool_action, modified_path, ContextGenerator, ContextInputs,
    FailureCategory, FallbackDecision, RateLimitDetection, RetryScheduler, Summarizer,
};
use vigil_stream::{AgentMessage, DecoderItem, StepTokenUsage, StreamDecoder};

use crate::completion::{
    CompletionRecord, CompletionStatus, CompletionTracker, ExitDirective, StepBoundaryReason,
    TodoItem,
};
use crate::config::SupervisorConfig;
use crate::events::{emit, EventSink, SupervisorEvent, TaskStage, TaskStatus};
use crate::launcher::{AgentLauncher, LaunchSpec};

/// Terse resumption instruction for a same-model retry; the session
/// carries the full context, so nothing else is repeated.
const RETRY_RESUME_INSTRUCTION: &str =
    "Continue the task. Do not repeat work that is already complete.";

const CONTINUATION_PROMPT: &str = "You stopped without reporting completion. Continue working on \
the task and, once it is finished, report the outcome with the completion tool.";

/// Control line written to the agent's stdin for a soft stop.
const INTERRUPT_CONTROL_LINE: &str = "{\"type\":\"interrupt\"}";

/// Upper bound on stored error excerpts.
const ERROR_EXCERPT_CHARS: usize = 240;

fn partial_continuation_prompt(remaining_work: &str) -> String {
    format!(
        "The task was reported as partially complete. Remaining work: {remaining_work}. Finish \
the remaining work and report completion again."
    )
}

/// One task to supervise.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    pub prompt: String,
    /// Resume an earlier conversation instead of starting fresh.
    pub resume_session: Option<String>,
    pub workdir: Option<PathBuf>,
}

/// Final result of a supervised task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub completion: Option<CompletionRecord>,
    pub session_id: Option<String>,
    pub totals: LedgerTotals,
    pub error: Option<String>,
}

/// Control messages a host can send to a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Kill the subprocess immediately; ledger data is persisted first.
    Cancel,
    /// Soft stop: the agent is asked to wind down, nothing is killed.
    Interrupt,
    /// Line-terminated answer to a question the agent asked.
    Respond(String),
}

/// Cloneable control handle for a running task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub fn cancel(&self) {
        let _ = self.commands.send(SupervisorCommand::Cancel);
    }

    pub fn interrupt(&self) {
        let _ = self.commands.send(SupervisorCommand::Interrupt);
    }

    pub fn respond(&self, answer: impl Into<String>) {
        let _ = self.commands.send(SupervisorCommand::Respond(answer.into()));
    }
}

#[derive(Debug)]
enum InvocationOutcome {
    Exited { code: i32 },
    RateLimited(RateLimitDetection),
    CostLimited,
    Cancelled,
    LaunchFailed(String),
}

/// Supervises one task: owns the live subprocess, the stream decoder,
/// the completion tracker, and the ledger/guard pair for that task id.
///
/// Construct one instance per task and drop it when the task ends;
/// nothing here is shared between tasks.
pub struct TaskSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn AgentLauncher>,
    context_generator: ContextGenerator,
    handlers: Vec<EventSink>,
    command_tx: mpsc::UnboundedSender<SupervisorCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<SupervisorCommand>>,

    decoder: StreamDecoder,
    completion: CompletionTracker,
    ledger: TokenLedger,
    guard: CostGuard,
    session_id: Option<String>,
    model: String,
    provider: String,
    phase: ExecutionPhase,
    original_request: String,
    actions: Vec<String>,
    modified_files: Vec<String>,
    workdir: Option<PathBuf>,

    /// Set once a deliberate kill-for-restart is underway so the dying
    /// subprocess's exit can't race the next invocation as a failure.
    restart_underway: bool,
    pending_rate_limit: Option<RateLimitDetection>,
    cost_limited: bool,
    interrupted: bool,
    fallback_active: bool,
    last_error: Option<String>,
}

impl TaskSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn AgentLauncher>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let context_generator = ContextGenerator::new(config.context_config(), summarizer);
        let guard = CostGuard::new(config.cost_guard_config());
        let completion = CompletionTracker::new(config.max_continuations);
        let model = config.primary_model.clone();
        let provider = config.primary_provider.clone();
        Self {
            config,
            launcher,
            context_generator,
            handlers: Vec::new(),
            command_tx,
            command_rx: Some(command_rx),
            decoder: StreamDecoder::new(),
            completion,
            ledger: TokenLedger::new("unstarted"),
            guard,
            session_id: None,
            model,
            provider,
            phase: ExecutionPhase::Primary,
            original_request: String::new(),
            actions: Vec::new(),
            modified_files: Vec::new(),
            workdir: None,
            restart_underway: false,
            pending_rate_limit: None,
            cost_limited: false,
            interrupted: false,
            fallback_active: false,
            last_error: None,
        }
    }

    pub fn add_event_handler(&mut self, handler: EventSink) {
        self.handlers.push(handler);
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Runs the task to completion, chaining retry, fallback, and
    /// continuation invocations over the same session as needed.
    pub async fn run(&mut self, request: TaskRequest) -> TaskOutcome {
        self.reset_for_task(&request);
        let mut command_rx = self
            .command_rx
            .take()
            .expect("task supervisor instances run one task at a time");
        let mut retry = RetryScheduler::new(self.config.retry_policy());
        let mut next_prompt = request.prompt.clone();
        let mut continuation_phase = false;

        let status = loop {
            self.decoder.reset();
            self.completion.begin_invocation();
            self.restart_underway = false;
            self.pending_rate_limit = None;
            self.emit_event(SupervisorEvent::Stage {
                stage: TaskStage::Connecting,
            });

            let outcome = if continuation_phase {
                // The watchdog guarantees a silently stuck continuation
                // can never block the caller indefinitely.
                let watchdog = Duration::from_millis(self.config.continuation_watchdog_ms.max(1));
                match timeout(watchdog, self.run_invocation(&next_prompt, &mut command_rx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            task_id = %self.ledger.task_id(),
                            "continuation watchdog fired, forcing completion"
                        );
                        self.completion.force_complete();
                        break TaskStatus::Success;
                    }
                }
            } else {
                self.run_invocation(&next_prompt, &mut command_rx).await
            };

            match outcome {
                InvocationOutcome::Cancelled => break TaskStatus::Interrupted,
                InvocationOutcome::CostLimited => break TaskStatus::Interrupted,
                InvocationOutcome::LaunchFailed(error) => {
                    if self.fallback_active {
                        self.emit_event(SupervisorEvent::FallbackFailed {
                            model: self.model.clone(),
                            error: error.clone(),
                        });
                    }
                    self.last_error = Some(error);
                    break TaskStatus::Error;
                }
                InvocationOutcome::RateLimited(detection) => {
                    if retry.should_retry() {
                        let delay_ms = retry.next_delay_ms(detection.suggested_wait_ms);
                        let attempt = retry.record_attempt();
                        info!(
                            attempt,
                            max_attempts = retry.max_attempts(),
                            delay_ms,
                            category = detection.category.as_str(),
                            "rate limited, retrying on the same session"
                        );
                        self.emit_event(SupervisorEvent::Stage {
                            stage: TaskStage::RetryWaiting,
                        });
                        if !self.wait_for_retry(delay_ms, &mut command_rx).await {
                            break TaskStatus::Interrupted;
                        }
                        self.emit_event(SupervisorEvent::Stage {
                            stage: TaskStage::RetryAttempting,
                        });
                        self.phase = ExecutionPhase::Retry;
                        next_prompt = RETRY_RESUME_INSTRUCTION.to_string();
                        continuation_phase = false;
                        continue;
                    }

                    self.emit_event(SupervisorEvent::Stage {
                        stage: TaskStage::RetryExhausted,
                    });
                    if self.fallback_active {
                        let error = format!(
                            "fallback model rate limited after {} retries",
                            retry.attempts_made()
                        );
                        self.emit_event(SupervisorEvent::FallbackFailed {
                            model: self.model.clone(),
                            error: error.clone(),
                        });
                        self.last_error = Some(error);
                        break TaskStatus::Error;
                    }

                    let decision = self.plan_fallback(detection.category).await;
                    if !decision.should_fallback {
                        self.last_error = Some(
                            "rate-limit retries exhausted and no fallback model is configured"
                                .to_string(),
                        );
                        break TaskStatus::Error;
                    }
                    let to_model = decision
                        .fallback_model
                        .clone()
                        .expect("approved fallback carries a model");
                    let to_provider = decision
                        .fallback_provider
                        .clone()
                        .expect("approved fallback carries a provider");
                    self.emit_event(SupervisorEvent::Stage {
                        stage: TaskStage::Fallback,
                    });
                    self.emit_event(SupervisorEvent::FallbackStarted {
                        from_model: self.model.clone(),
                        to_model: to_model.clone(),
                    });
                    self.model = to_model;
                    self.provider = to_provider;
                    self.phase = ExecutionPhase::Fallback;
                    self.fallback_active = true;
                    // A fallback starts its own retry accounting.
                    retry = RetryScheduler::new(self.config.retry_policy());
                    next_prompt = decision
                        .context
                        .clone()
                        .unwrap_or_else(|| RETRY_RESUME_INSTRUCTION.to_string());
                    continuation_phase = false;
                    continue;
                }
                InvocationOutcome::Exited { code } if self.interrupted => {
                    // Soft stop: the agent wound down; never chain another
                    // invocation after an interrupt.
                    if self.fallback_active && self.completion.has_completion() {
                        self.emit_event(SupervisorEvent::FallbackCompleted {
                            model: self.model.clone(),
                        });
                    }
                    break self.map_final_status(CompletionStatus::Unknown, code);
                }
                InvocationOutcome::Exited { code } => match self.completion.on_process_exit(code) {
                    ExitDirective::StartContinuation { attempt } => {
                        info!(attempt, "agent stopped without a completion signal, continuing");
                        self.phase = ExecutionPhase::Continuation;
                        next_prompt = CONTINUATION_PROMPT.to_string();
                        continuation_phase = true;
                        continue;
                    }
                    ExitDirective::StartPartialContinuation { remaining_work } => {
                        info!("partial completion reported, continuing with remaining work");
                        self.phase = ExecutionPhase::Continuation;
                        next_prompt = partial_continuation_prompt(&remaining_work);
                        continuation_phase = true;
                        continue;
                    }
                    ExitDirective::Finalize { status } => {
                        if self.fallback_active {
                            self.emit_event(SupervisorEvent::FallbackCompleted {
                                model: self.model.clone(),
                            });
                        }
                        break self.map_final_status(status, code);
                    }
                },
            }
        };

        self.command_rx = Some(command_rx);
        self.finish(status)
    }

    fn reset_for_task(&mut self, request: &TaskRequest) {
        self.ledger.clear(request.task_id.clone());
        let handlers = self.handlers.clone();
        let warn_handlers = self.handlers.clone();
        self.guard = CostGuard::with_callbacks(
            self.config.cost_guard_config(),
            Some(Arc::new(move |state| {
                emit(
                    &warn_handlers,
                    &SupervisorEvent::TokenLimitWarning { state },
                );
            })),
            Some(Arc::new(move |state| {
                emit(&handlers, &SupervisorEvent::TokenLimitReached { state });
            })),
        );
        self.completion = CompletionTracker::new(self.config.max_continuations);
        self.decoder.reset();
        self.session_id = request.resume_session.clone();
        if let Some(session) = &self.session_id {
            self.ledger.set_session_id(session.clone());
        }
        self.model = self.config.primary_model.clone();
        self.provider = self.config.primary_provider.clone();
        self.phase = ExecutionPhase::Primary;
        self.original_request = request.prompt.clone();
        self.actions.clear();
        self.modified_files.clear();
        self.workdir = request.workdir.clone();
        self.restart_underway = false;
        self.pending_rate_limit = None;
        self.cost_limited = false;
        self.interrupted = false;
        self.fallback_active = false;
        self.last_error = None;
    }

    async fn run_invocation(
        &mut self,
        prompt: &str,
        commands: &mut mpsc::UnboundedReceiver<SupervisorCommand>,
    ) -> InvocationOutcome {
        let spec = LaunchSpec {
            task_id: self.ledger.task_id().to_string(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            prompt: prompt.to_string(),
            resume_session: self.session_id.clone(),
            workdir: self.workdir.clone(),
        };
        let launched = match self.launcher.launch(&spec).await {
            Ok(launched) => launched,
            Err(error) => return InvocationOutcome::LaunchFailed(error.to_string()),
        };
        let mut child = launched.child;
        let Some(mut stdout) = child.stdout.take() else {
            return InvocationOutcome::LaunchFailed("agent stdout was not piped".to_string());
        };
        let mut stdin = child.stdin.take();

        self.emit_event(SupervisorEvent::Stage {
            stage: TaskStage::Waiting,
        });

        let mut read_buffer = [0u8; 8192];
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Cancel) | None => {
                        info!(task_id = %self.ledger.task_id(), "cancelling task");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return InvocationOutcome::Cancelled;
                    }
                    Some(SupervisorCommand::Interrupt) => {
                        info!(task_id = %self.ledger.task_id(), "soft-stopping agent");
                        self.interrupted = true;
                        if let Some(stdin) = stdin.as_mut() {
                            if write_line(stdin, INTERRUPT_CONTROL_LINE).await.is_err() {
                                warn!("failed to deliver interrupt control line");
                            }
                        }
                    }
                    Some(SupervisorCommand::Respond(answer)) => {
                        if let Some(stdin) = stdin.as_mut() {
                            if write_line(stdin, &answer).await.is_err() {
                                warn!("failed to deliver response to agent prompt");
                            }
                        }
                    }
                },
                read = stdout.read(&mut read_buffer) => match read {
                    Ok(0) => {
                        let items = self.decoder.flush();
                        self.handle_items(items);
                        let code = match child.wait().await {
                            Ok(status) => status.code().unwrap_or(-1),
                            Err(_) => -1,
                        };
                        if self.cost_limited {
                            return InvocationOutcome::CostLimited;
                        }
                        if self.restart_underway || self.pending_rate_limit.is_some() {
                            self.ledger.finalize_phase();
                            let detection = self
                                .pending_rate_limit
                                .take()
                                .unwrap_or_else(|| classify_failure("rate limit"));
                            return InvocationOutcome::RateLimited(detection);
                        }
                        debug!(code, "agent subprocess exited");
                        return InvocationOutcome::Exited { code };
                    }
                    Ok(read_bytes) => {
                        let items = self.decoder.feed(&read_buffer[..read_bytes]);
                        self.handle_items(items);
                        if self.cost_limited {
                            // Internally-initiated cancellation, not an error.
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            let items = self.decoder.flush();
                            self.handle_items(items);
                            return InvocationOutcome::CostLimited;
                        }
                        if self.pending_rate_limit.is_some() {
                            // Deliberate kill-for-restart: finalize the
                            // ledger phase first, then suppress this
                            // child's exit handling.
                            self.restart_underway = true;
                            self.ledger.finalize_phase();
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            let items = self.decoder.flush();
                            self.handle_items(items);
                            let detection = self
                                .pending_rate_limit
                                .take()
                                .expect("rate-limit detection recorded");
                            return InvocationOutcome::RateLimited(detection);
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "reading agent output failed");
                        let _ = child.start_kill();
                        let code = child
                            .wait()
                            .await
                            .ok()
                            .and_then(|status| status.code())
                            .unwrap_or(-1);
                        return InvocationOutcome::Exited { code };
                    }
                }
            }
        }
    }

    /// Waits out a scheduled retry delay. Returns false when the wait was
    /// cut short by cancel/interrupt; the timer is dropped (cleared)
    /// before either action completes.
    async fn wait_for_retry(
        &mut self,
        delay_ms: u64,
        commands: &mut mpsc::UnboundedReceiver<SupervisorCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Cancel) | None => return false,
                    Some(SupervisorCommand::Interrupt) => {
                        self.interrupted = true;
                        return false;
                    }
                    // No live subprocess to answer during a retry wait.
                    Some(SupervisorCommand::Respond(_)) => {}
                }
            }
        }
    }

    async fn plan_fallback(&mut self, error_category: FailureCategory) -> FallbackDecision {
        let Some(target) = self.config.fallback_target() else {
            return FallbackDecision::declined(error_category);
        };
        let inputs = ContextInputs {
            original_request: self.original_request.clone(),
            recent_actions: self.actions.clone(),
            modified_files: self.modified_files.clone(),
            open_items: self.completion.open_items(),
            last_reply: self.completion.last_reply().map(str::to_string),
        };
        let generated = self.context_generator.generate(&inputs).await;
        if let Some(tokens_used) = generated.summarizer_tokens_used {
            let usage = StepUsage {
                output_tokens: tokens_used,
                ..StepUsage::default()
            };
            let model = generated
                .summarizer_model
                .clone()
                .unwrap_or_else(|| "summarizer".to_string());
            self.ledger
                .record_step(model, "summarizer", ExecutionPhase::Summarization, usage, 0.0);
        }
        debug!(method = generated.method.as_str(), "continuation brief generated");
        FallbackDecision::approved(&target, &generated, error_category)
    }

    fn handle_items(&mut self, items: Vec<DecoderItem>) {
        for item in items {
            match item {
                DecoderItem::Message(message) => self.handle_message(message),
                DecoderItem::Raw(line) => self.handle_raw_line(&line),
                DecoderItem::Overflow { discarded_bytes } => {
                    warn!(discarded_bytes, "decoder discarded an oversized buffer");
                }
            }
        }
    }

    fn handle_message(&mut self, message: AgentMessage) {
        self.note_session_id(message.session_id());
        self.emit_event(SupervisorEvent::Message {
            message: message.clone(),
        });
        match message {
            AgentMessage::StepStart { .. } => {}
            AgentMessage::Text { text, .. } => self.completion.record_reply(&text),
            AgentMessage::ToolCall {
                name, arguments, ..
            } => self.handle_tool_invocation(&name, &arguments, None, false),
            AgentMessage::ToolUse {
                name,
                arguments,
                result,
                is_error,
                ..
            } => self.handle_tool_invocation(&name, &arguments, result, is_error),
            AgentMessage::ToolResult {
                name,
                result,
                is_error,
                ..
            } => self.emit_event(SupervisorEvent::ToolResult {
                name,
                result,
                is_error,
            }),
            AgentMessage::StepFinish {
                reason,
                usage,
                cost,
                ..
            } => self.handle_step_finish(reason.as_deref(), usage, cost),
            AgentMessage::Error { message, .. } => self.handle_error_text(&message),
        }
    }

    fn handle_tool_invocation(
        &mut self,
        name: &str,
        arguments: &Value,
        result: Option<Value>,
        is_error: bool,
    ) {
        self.completion.record_tool_use();
        self.emit_event(SupervisorEvent::Stage {
            stage: TaskStage::ToolUse,
        });
        self.emit_event(SupervisorEvent::ToolUse {
            name: name.to_string(),
            arguments: arguments.clone(),
        });
        self.actions.push(describe_tool_action(name, arguments));
        if let Some(path) = modified_path(name, arguments) {
            if !self.modified_files.contains(&path) {
                self.modified_files.push(path);
            }
        }

        if name == self.config.todo_tool {
            let items: Vec<TodoItem> = arguments
                .get("items")
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default();
            self.completion.record_todos(items.clone());
            self.emit_event(SupervisorEvent::TodoUpdate { items });
        } else if name == self.config.completion_tool {
            let record = self.completion.record_completion(arguments);
            info!(status = ?record.status, "completion signal recorded");
        }

        if let Some(result) = result {
            self.emit_event(SupervisorEvent::ToolResult {
                name: Some(name.to_string()),
                result,
                is_error,
            });
        }
    }

    fn handle_step_finish(
        &mut self,
        reason: Option<&str>,
        usage: Option<StepTokenUsage>,
        cost: Option<f64>,
    ) {
        let usage = usage.unwrap_or_default();
        let step_usage = StepUsage {
            input_tokens: usage.input,
            output_tokens: usage.output,
            reasoning_tokens: usage.reasoning,
            cache_read_tokens: usage.cache.read,
            cache_write_tokens: usage.cache.write,
        };
        let cost = cost.unwrap_or(0.0);
        self.ledger
            .record_step(self.model.clone(), self.provider.clone(), self.phase, step_usage, cost);
        self.emit_event(SupervisorEvent::TokenUsageUpdate {
            totals: self.ledger.totals(),
        });
        if !self.guard.add_cost(cost) {
            self.cost_limited = true;
        }
        let decision = self
            .completion
            .on_step_boundary(StepBoundaryReason::parse(reason));
        debug!(?decision, "step boundary handled");
    }

    fn handle_error_text(&mut self, text: &str) {
        let detection = classify_failure(text);
        if detection.is_rate_limit {
            info!(
                category = detection.category.as_str(),
                provider = detection.provider.as_deref().unwrap_or("unknown"),
                "rate limit reported by agent"
            );
            self.pending_rate_limit = Some(detection);
            return;
        }
        if detection.category == FailureCategory::Auth {
            self.emit_event(SupervisorEvent::AuthError {
                message: text.to_string(),
            });
        }
        self.last_error = Some(vigil_core::excerpt(text, ERROR_EXCERPT_CHARS));
    }

    /// Unstructured output still gets classified: throttling and auth
    /// failures often arrive as plain log lines, not error records.
    fn handle_raw_line(&mut self, line: &str) {
        let detection = classify_failure(line);
        if detection.is_rate_limit {
            info!(category = detection.category.as_str(), "rate limit derived from agent logs");
            self.pending_rate_limit = Some(detection);
        } else if detection.category == FailureCategory::Auth {
            self.emit_event(SupervisorEvent::AuthError {
                message: line.to_string(),
            });
        } else {
            debug!(line, "unstructured agent output");
        }
    }

    fn note_session_id(&mut self, observed: Option<&str>) {
        let Some(observed) = observed.map(str::trim).filter(|id| !id.is_empty()) else {
            return;
        };
        match &self.session_id {
            None => {
                self.session_id = Some(observed.to_string());
                self.ledger.set_session_id(observed.to_string());
            }
            Some(existing) if existing != observed => {
                warn!(
                    existing = %existing,
                    observed = %observed,
                    "session id changed mid-attempt, keeping the original"
                );
            }
            _ => {}
        }
    }

    fn map_final_status(&mut self, status: CompletionStatus, exit_code: i32) -> TaskStatus {
        if self.completion.has_completion() {
            // The completion signal is authoritative even when the process
            // was torn down afterwards with a non-zero code.
            return TaskStatus::Success;
        }
        if self.interrupted {
            return TaskStatus::Interrupted;
        }
        if status == CompletionStatus::Success {
            return TaskStatus::Success;
        }
        if exit_code != 0 {
            self.last_error = Some(format!(
                "agent exited with status {exit_code} before signaling completion"
            ));
            return TaskStatus::Error;
        }
        TaskStatus::Success
    }

    fn finish(&mut self, status: TaskStatus) -> TaskOutcome {
        self.emit_event(SupervisorEvent::TokenUsageUpdate {
            totals: self.ledger.totals(),
        });
        if let Some(dir) = self.config.usage_dir.clone() {
            if let Err(error) = self.ledger.persist(&dir) {
                warn!(error = %error, "failed to persist usage report");
            }
        }
        self.emit_event(SupervisorEvent::Complete {
            status,
            error: self.last_error.clone(),
        });
        TaskOutcome {
            task_id: self.ledger.task_id().to_string(),
            status,
            completion: self.completion.record().cloned(),
            session_id: self.session_id.clone(),
            totals: self.ledger.totals(),
            error: self.last_error.clone(),
        }
    }

    fn emit_event(&self, event: SupervisorEvent) {
        emit(&self.handlers, &event);
    }
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        stdin.write_all(b"\n").await?;
    }
    stdin.flush().await
}
