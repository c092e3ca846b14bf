use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Completion status declared by the agent, post-downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Partial,
    Blocked,
    Unknown,
}

/// The agent's completion declaration as recorded by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRecord {
    pub status: CompletionStatus,
    pub summary: String,
    pub original_request_summary: String,
    pub remaining_work: Option<String>,
}

/// One checklist entry reported through the todo tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub completed: bool,
}

/// Where the completion protocol stands. The plain-continuation and
/// partial-continuation tracks are mutually exclusive; `Blocked` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Idle,
    ContinuationPending,
    ContinuationRunning,
    PartialContinuationPending,
    PartialContinuationRunning,
    Done,
    MaxRetriesReached,
    Blocked,
}

/// Step-finish reason as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepBoundaryReason {
    Stop,
    EndTurn,
    ToolUse,
    Other,
}

impl StepBoundaryReason {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("") {
            "stop" | "stop_sequence" => Self::Stop,
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            _ => Self::Other,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Stop | Self::EndTurn)
    }
}

/// Decision returned at a step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryDecision {
    /// Non-terminal boundary; nothing to do.
    Continue,
    /// A continuation must run before completion can be reported.
    Pending,
    Complete,
}

/// Directive returned when the subprocess exits.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDirective {
    StartContinuation { attempt: u32 },
    StartPartialContinuation { remaining_work: String },
    Finalize { status: CompletionStatus },
}

/// Tracks whether the agent explicitly signaled completion and decides
/// between continuation, partial-continuation, and finalization.
///
/// Commands in, decisions out; the owning supervisor performs all side
/// effects, which keeps this machine testable in isolation.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    state: CompletionState,
    record: Option<CompletionRecord>,
    todos: Vec<TodoItem>,
    tool_used_this_invocation: bool,
    continuation_attempts: u32,
    max_continuations: u32,
    last_reply: Option<String>,
}

impl CompletionTracker {
    pub fn new(max_continuations: u32) -> Self {
        Self {
            state: CompletionState::Idle,
            record: None,
            todos: Vec::new(),
            tool_used_this_invocation: false,
            continuation_attempts: 0,
            max_continuations,
            last_reply: None,
        }
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    pub fn record(&self) -> Option<&CompletionRecord> {
        self.record.as_ref()
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.last_reply.as_deref()
    }

    /// Checklist entries still open, as prose lines.
    pub fn open_items(&self) -> Vec<String> {
        self.todos
            .iter()
            .filter(|item| !item.completed)
            .map(|item| item.content.clone())
            .collect()
    }

    /// Resets per-invocation bookkeeping; task-level history is kept.
    pub fn begin_invocation(&mut self) {
        self.tool_used_this_invocation = false;
    }

    pub fn record_tool_use(&mut self) {
        self.tool_used_this_invocation = true;
    }

    pub fn record_todos(&mut self, items: Vec<TodoItem>) {
        self.todos = items;
    }

    pub fn record_reply(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.last_reply = Some(text.to_string());
        }
    }

    /// Records the agent's completion tool call.
    ///
    /// The downgrade rule runs first: `success` with open checklist items
    /// is rewritten to `partial`, with the remaining work synthesized from
    /// those items, before anything downstream can observe the record.
    pub fn record_completion(&mut self, arguments: &Value) -> CompletionRecord {
        let mut status = match arguments.get("status").and_then(Value::as_str) {
            Some("success") => CompletionStatus::Success,
            Some("partial") => CompletionStatus::Partial,
            Some("blocked") => CompletionStatus::Blocked,
            other => {
                warn!(status = ?other, "unrecognized completion status");
                CompletionStatus::Unknown
            }
        };
        let mut remaining_work = string_arg(arguments, "remaining_work");

        let open = self.open_items();
        if status == CompletionStatus::Success && !open.is_empty() {
            debug!(
                open_items = open.len(),
                "downgrading success completion to partial"
            );
            status = CompletionStatus::Partial;
            remaining_work = Some(open.join("; "));
        }

        let record = CompletionRecord {
            status,
            summary: string_arg(arguments, "summary").unwrap_or_default(),
            original_request_summary: string_arg(arguments, "original_request_summary")
                .unwrap_or_default(),
            remaining_work,
        };
        self.record = Some(record.clone());

        match status {
            CompletionStatus::Blocked => self.state = CompletionState::Blocked,
            CompletionStatus::Partial => {
                // A partial signal supersedes a plain continuation; the two
                // tracks are never active together.
                if !matches!(
                    self.state,
                    CompletionState::PartialContinuationRunning
                        | CompletionState::Done
                        | CompletionState::Blocked
                        | CompletionState::MaxRetriesReached
                ) {
                    self.state = CompletionState::PartialContinuationPending;
                }
            }
            _ => {}
        }
        record
    }

    /// Decision table for a step boundary; only terminal reasons act.
    pub fn on_step_boundary(&mut self, reason: StepBoundaryReason) -> BoundaryDecision {
        if !reason.is_terminal() {
            return BoundaryDecision::Continue;
        }
        if self.state == CompletionState::PartialContinuationPending {
            return BoundaryDecision::Pending;
        }
        if self.record.is_none() {
            if !self.tool_used_this_invocation {
                // Conversational response, not a task; resolve immediately.
                self.state = CompletionState::Done;
                return BoundaryDecision::Complete;
            }
            if self.continuation_attempts < self.max_continuations {
                self.state = CompletionState::ContinuationPending;
                return BoundaryDecision::Pending;
            }
            self.state = CompletionState::MaxRetriesReached;
            return BoundaryDecision::Complete;
        }
        BoundaryDecision::Complete
    }

    /// Kickoff point for pending continuations; otherwise finalizes.
    ///
    /// The exit code is deliberately not consulted: once a completion
    /// signal is recorded it is authoritative, and the supervisor maps
    /// signalless non-zero exits to task failures itself.
    pub fn on_process_exit(&mut self, _exit_code: i32) -> ExitDirective {
        match self.state {
            CompletionState::ContinuationPending => {
                self.continuation_attempts = self.continuation_attempts.saturating_add(1);
                self.state = CompletionState::ContinuationRunning;
                ExitDirective::StartContinuation {
                    attempt: self.continuation_attempts,
                }
            }
            CompletionState::PartialContinuationPending => {
                self.state = CompletionState::PartialContinuationRunning;
                let remaining_work = self
                    .record
                    .as_ref()
                    .and_then(|record| record.remaining_work.clone())
                    .unwrap_or_else(|| self.open_items().join("; "));
                ExitDirective::StartPartialContinuation { remaining_work }
            }
            _ => {
                let status = self.finalize();
                ExitDirective::Finalize { status }
            }
        }
    }

    /// Watchdog path: a continuation went silent, so the task is marked
    /// done rather than blocking the caller indefinitely.
    pub fn force_complete(&mut self) {
        if !matches!(self.state, CompletionState::Blocked) {
            self.state = CompletionState::Done;
        }
    }

    pub fn has_completion(&self) -> bool {
        self.record.is_some()
    }

    fn finalize(&mut self) -> CompletionStatus {
        if let Some(record) = &self.record {
            if record.status != CompletionStatus::Blocked {
                self.state = CompletionState::Done;
            }
            return record.status;
        }
        match self.state {
            CompletionState::Done => CompletionStatus::Success,
            _ => {
                if self.state != CompletionState::MaxRetriesReached {
                    self.state = CompletionState::Done;
                }
                CompletionStatus::Unknown
            }
        }
    }
}

fn string_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
