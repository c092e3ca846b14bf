//! Supervision core for a long-running, interactive coding-agent
//! subprocess.
//!
//! One [`TaskSupervisor`] instance owns one task: it launches the agent
//! through a collaborator-supplied [`AgentLauncher`], decodes the
//! streamed output, enforces the explicit completion protocol, recovers
//! from upstream throttling via same-session retries and model fallback,
//! and meters token spend against a hard budget throughout.

pub mod completion;
pub mod config;
pub mod events;
pub mod launcher;
pub mod supervisor;

pub use completion::{
    BoundaryDecision, CompletionRecord, CompletionState, CompletionStatus, CompletionTracker,
    ExitDirective, StepBoundaryReason, TodoItem,
};
pub use config::{load_supervisor_config, SupervisorConfig};
pub use events::{EventSink, SupervisorEvent, TaskStage, TaskStatus};
pub use launcher::{AgentLauncher, CommandLauncher, LaunchError, LaunchSpec, LaunchedAgent};
pub use supervisor::{
    SupervisorCommand, SupervisorHandle, TaskOutcome, TaskRequest, TaskSupervisor,
};
