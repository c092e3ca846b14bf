use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use vigil_ledger::CostGuardConfig;
use vigil_recovery::{ContextGeneratorConfig, ContextStrategy, FallbackTarget, RetryPolicy};

/// Everything a task supervisor is parameterized by: models, retry and
/// continuation bounds, cost ceilings, brief strategy, and tool names.
///
/// Process-wide defaults are read-only data; every task gets its own
/// copy at construction time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub primary_model: String,
    pub primary_provider: String,
    pub fallback_model: Option<String>,
    pub fallback_provider: Option<String>,
    pub max_rate_limit_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_fraction: f64,
    pub max_continuations: u32,
    pub continuation_watchdog_ms: u64,
    pub max_cost_usd: f64,
    pub cost_warn_fraction: f64,
    pub context_strategy: ContextStrategy,
    pub max_recent_actions: usize,
    pub last_reply_max_chars: usize,
    pub summary_max_tokens: u32,
    pub completion_tool: String,
    pub todo_tool: String,
    /// Where per-task usage reports land; `None` disables persistence.
    pub usage_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            primary_model: "claude-sonnet-4-20250514".to_string(),
            primary_provider: "anthropic".to_string(),
            fallback_model: None,
            fallback_provider: None,
            max_rate_limit_retries: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            retry_jitter_fraction: 0.2,
            max_continuations: 3,
            continuation_watchdog_ms: 300_000,
            max_cost_usd: 10.0,
            cost_warn_fraction: 0.8,
            context_strategy: ContextStrategy::Template,
            max_recent_actions: 12,
            last_reply_max_chars: 600,
            summary_max_tokens: 512,
            completion_tool: "complete_task".to_string(),
            todo_tool: "update_todos".to_string(),
            usage_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_rate_limit_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            jitter_fraction: self.retry_jitter_fraction,
        }
    }

    pub fn context_config(&self) -> ContextGeneratorConfig {
        ContextGeneratorConfig {
            strategy: self.context_strategy,
            max_recent_actions: self.max_recent_actions,
            last_reply_max_chars: self.last_reply_max_chars,
            summary_max_tokens: self.summary_max_tokens,
        }
    }

    pub fn cost_guard_config(&self) -> CostGuardConfig {
        CostGuardConfig {
            max_cost_usd: self.max_cost_usd,
            warn_fraction: self.cost_warn_fraction,
        }
    }

    /// Configured fallback pair, when both halves are present.
    pub fn fallback_target(&self) -> Option<FallbackTarget> {
        match (&self.fallback_model, &self.fallback_provider) {
            (Some(model), Some(provider)) => Some(FallbackTarget {
                model: model.clone(),
                provider: provider.clone(),
            }),
            (Some(model), None) => Some(FallbackTarget {
                model: model.clone(),
                provider: self.primary_provider.clone(),
            }),
            _ => None,
        }
    }
}

/// Loads a supervisor config from a TOML file.
pub fn load_supervisor_config(path: &Path) -> Result<SupervisorConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read supervisor config {}", path.display()))?;
    let config: SupervisorConfig = toml::from_str(&raw)
        .with_context(|| format!("parse supervisor config {}", path.display()))?;
    Ok(config)
}
