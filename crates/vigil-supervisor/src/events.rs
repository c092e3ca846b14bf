use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use vigil_ledger::{CostGuardState, LedgerTotals};
use vigil_stream::AgentMessage;

use crate::completion::TodoItem;

/// Coarse progress stage surfaced to the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Connecting,
    Waiting,
    ToolUse,
    RetryWaiting,
    RetryAttempting,
    RetryExhausted,
    Fallback,
}

/// Final disposition reported in the `Complete` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
    Interrupted,
}

/// Everything a running task reports outward: decoded records, tool
/// activity, progress stages, recovery transitions, spend updates, and
/// the final disposition.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// One decoded record, replayed in arrival order.
    Message { message: AgentMessage },
    ToolUse {
        name: String,
        arguments: Value,
    },
    ToolResult {
        name: Option<String>,
        result: Value,
        is_error: bool,
    },
    Stage { stage: TaskStage },
    Complete {
        status: TaskStatus,
        error: Option<String>,
    },
    FallbackStarted {
        from_model: String,
        to_model: String,
    },
    FallbackCompleted { model: String },
    FallbackFailed {
        model: String,
        error: String,
    },
    TokenUsageUpdate { totals: LedgerTotals },
    TokenLimitWarning { state: CostGuardState },
    TokenLimitReached { state: CostGuardState },
    TodoUpdate { items: Vec<TodoItem> },
    /// Authentication failure surfaced from the agent's logs, passed
    /// through untouched for the host to handle.
    AuthError { message: String },
}

/// Registered event handler.
pub type EventSink = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

/// Delivers an event to every sink, isolating handler panics.
pub(crate) fn emit(handlers: &[EventSink], event: &SupervisorEvent) {
    for handler in handlers {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
    }
}
