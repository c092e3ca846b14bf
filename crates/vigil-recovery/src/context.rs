use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_core::excerpt;

use crate::rate_limit::FailureCategory;
use crate::summarize::{SummarizeRequest, Summarizer};

/// Fixed closing instruction shared by both strategies.
const CONTINUATION_INSTRUCTION: &str = "Continue this task from where it stopped. Do not repeat \
work that is already complete; verify the outstanding items and finish them.";

/// Everything known about the interrupted task when a brief is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextInputs {
    pub original_request: String,
    /// Already translated to prose, oldest first.
    pub recent_actions: Vec<String>,
    pub modified_files: Vec<String>,
    pub open_items: Vec<String>,
    pub last_reply: Option<String>,
}

/// Which path builds the brief: the free deterministic template, or a
/// remote summarizer with the template as its safety net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    #[default]
    Template,
    Delegated,
}

/// How a brief was actually produced. Requesting the delegated strategy
/// does not guarantee `Llm`; consumers must read this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMethod {
    Template,
    Llm,
}

impl ContextMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Llm => "llm",
        }
    }
}

/// A continuation brief plus the method that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContext {
    pub text: String,
    pub method: ContextMethod,
    /// Tokens spent by the summarizer, when the delegated path ran.
    pub summarizer_tokens_used: Option<u64>,
    pub summarizer_model: Option<String>,
}

/// Strategy selection plus the caps that keep a brief bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextGeneratorConfig {
    pub strategy: ContextStrategy,
    pub max_recent_actions: usize,
    pub last_reply_max_chars: usize,
    pub summary_max_tokens: u32,
}

impl Default for ContextGeneratorConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Template,
            max_recent_actions: 12,
            last_reply_max_chars: 600,
            summary_max_tokens: 512,
        }
    }
}

/// Alternate model/provider pair configured for failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTarget {
    pub model: String,
    pub provider: String,
}

/// Outcome of asking whether (and how) to switch models.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackDecision {
    pub should_fallback: bool,
    pub context: Option<String>,
    pub fallback_model: Option<String>,
    pub fallback_provider: Option<String>,
    pub context_method: Option<ContextMethod>,
    pub error_category: FailureCategory,
}

impl FallbackDecision {
    /// No configured target: the failure stands as-is.
    pub fn declined(error_category: FailureCategory) -> Self {
        Self {
            should_fallback: false,
            context: None,
            fallback_model: None,
            fallback_provider: None,
            context_method: None,
            error_category,
        }
    }

    /// Switch to `target`, carrying the generated brief.
    pub fn approved(
        target: &FallbackTarget,
        generated: &GeneratedContext,
        error_category: FailureCategory,
    ) -> Self {
        Self {
            should_fallback: true,
            context: Some(generated.text.clone()),
            fallback_model: Some(target.model.clone()),
            fallback_provider: Some(target.provider.clone()),
            context_method: Some(generated.method),
            error_category,
        }
    }
}

/// Builds continuation briefs, optionally delegating to a summarizer.
pub struct ContextGenerator {
    config: ContextGeneratorConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextGenerator {
    pub fn new(config: ContextGeneratorConfig, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        Self { config, summarizer }
    }

    /// Produces a brief. Any delegated-path failure falls back to the
    /// template, and the returned method reports what actually ran.
    pub async fn generate(&self, inputs: &ContextInputs) -> GeneratedContext {
        if self.config.strategy == ContextStrategy::Delegated {
            if let Some((summary, tokens_used, model)) = self.delegate(inputs).await {
                return GeneratedContext {
                    text: format!("{summary}\n\n{CONTINUATION_INSTRUCTION}"),
                    method: ContextMethod::Llm,
                    summarizer_tokens_used: tokens_used,
                    summarizer_model: model,
                };
            }
        }
        GeneratedContext {
            text: self.render_template(inputs),
            method: ContextMethod::Template,
            summarizer_tokens_used: None,
            summarizer_model: None,
        }
    }

    /// Decides retry-exhausted disposition: no configured target means no
    /// fallback; otherwise a brief is generated for the switch.
    pub async fn plan_fallback(
        &self,
        inputs: &ContextInputs,
        target: Option<&FallbackTarget>,
        error_category: FailureCategory,
    ) -> FallbackDecision {
        let Some(target) = target else {
            return FallbackDecision::declined(error_category);
        };
        let generated = self.generate(inputs).await;
        FallbackDecision::approved(target, &generated, error_category)
    }

    async fn delegate(&self, inputs: &ContextInputs) -> Option<(String, Option<u64>, Option<String>)> {
        let summarizer = self.summarizer.as_ref()?;
        let request = SummarizeRequest {
            task_description: inputs.original_request.clone(),
            tool_calls: inputs.recent_actions.join("\n"),
            last_response: inputs.last_reply.clone(),
            max_tokens: self.config.summary_max_tokens,
        };
        match summarizer.summarize(request).await {
            Ok(response) if response.success => {
                let summary = response
                    .summary
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                if summary.is_none() {
                    warn!("summarizer reported success without a summary, using template");
                }
                summary.map(|text| (text, response.tokens_used, response.model.clone()))
            }
            Ok(_) => {
                warn!("summarizer declined the request, using template");
                None
            }
            Err(error) => {
                warn!(error = %error, "summarizer call failed, using template");
                None
            }
        }
    }

    fn render_template(&self, inputs: &ContextInputs) -> String {
        let mut lines = vec![
            "You are resuming an interrupted coding task.".to_string(),
            String::new(),
            "Original request:".to_string(),
            inputs.original_request.clone(),
        ];

        if !inputs.recent_actions.is_empty() {
            lines.push(String::new());
            lines.push("Recent actions:".to_string());
            let cap = self.config.max_recent_actions;
            let elided = inputs.recent_actions.len().saturating_sub(cap);
            if elided > 0 {
                lines.push(format!("({elided} earlier actions elided)"));
            }
            for action in inputs.recent_actions.iter().skip(elided) {
                lines.push(format!("- {action}"));
            }
        }

        if !inputs.modified_files.is_empty() {
            lines.push(String::new());
            lines.push("Modified files:".to_string());
            for path in &inputs.modified_files {
                lines.push(format!("- {path}"));
            }
        }

        if !inputs.open_items.is_empty() {
            lines.push(String::new());
            lines.push("Outstanding checklist items:".to_string());
            for item in &inputs.open_items {
                lines.push(format!("- {item}"));
            }
        }

        if let Some(reply) = inputs.last_reply.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            lines.push(String::new());
            lines.push("Last reply (excerpt):".to_string());
            lines.push(excerpt(reply, self.config.last_reply_max_chars));
        }

        lines.push(String::new());
        lines.push(CONTINUATION_INSTRUCTION.to_string());
        lines.join("\n")
    }
}
