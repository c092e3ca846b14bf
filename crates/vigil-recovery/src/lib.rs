//! Throttling recovery primitives for the agent supervisor.
//!
//! Classifies upstream failures, schedules retries with jittered backoff,
//! translates tool activity into prose, and builds the continuation brief
//! carried into a model fallback.

pub mod actions;
pub mod context;
pub mod rate_limit;
pub mod retry;
pub mod summarize;

pub use actions::{describe_tool_action, modified_path};
pub use context::{
    ContextGenerator, ContextGeneratorConfig, ContextInputs, ContextMethod, ContextStrategy,
    FallbackDecision, FallbackTarget, GeneratedContext,
};
pub use rate_limit::{classify_failure, FailureCategory, RateLimitDetection};
pub use retry::{RetryPolicy, RetryScheduler};
pub use summarize::{
    HttpSummarizer, HttpSummarizerConfig, SummarizeError, SummarizeRequest, SummarizeResponse,
    Summarizer,
};
