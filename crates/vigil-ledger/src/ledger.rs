use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_core::write_json_atomic;

/// Bookkeeping tag for which attempt variant produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Primary,
    Retry,
    Fallback,
    Continuation,
    Summarization,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Continuation => "continuation",
            Self::Summarization => "summarization",
        }
    }
}

/// Token counters for one recorded step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl StepUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.reasoning_tokens)
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub model: String,
    pub provider: String,
    pub phase: ExecutionPhase,
    /// Task-global step index, monotonic across phases.
    pub step_number: u64,
    /// Step index within the current phase; restarts after `finalize_phase`.
    pub phase_step_count: u64,
    #[serde(flatten)]
    pub usage: StepUsage,
    pub cost_usd: f64,
    pub recorded_unix_ms: u64,
}

/// Entries recorded between two phase boundaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    pub entries: Vec<TokenEntry>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Running totals over the whole task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LedgerTotals {
    pub steps: u64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}

/// Usage record persisted once per task completion or interruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub task_id: String,
    pub session_id: Option<String>,
    pub written_at: String,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub entries: Vec<TokenEntry>,
}

/// Per-task token/cost ledger. Cleared only when a new task starts.
#[derive(Debug, Clone)]
pub struct TokenLedger {
    task_id: String,
    session_id: Option<String>,
    entries: Vec<TokenEntry>,
    step_number: u64,
    phase_step_count: u64,
    phase_start_index: usize,
}

impl TokenLedger {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: None,
            entries: Vec::new(),
            step_number: 0,
            phase_step_count: 0,
            phase_start_index: 0,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Records the session identifier once; later values are ignored.
    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        if self.session_id.is_none() {
            self.session_id = Some(session_id.into());
        }
    }

    /// Appends one step's usage under the given phase.
    pub fn record_step(
        &mut self,
        model: impl Into<String>,
        provider: impl Into<String>,
        phase: ExecutionPhase,
        usage: StepUsage,
        cost_usd: f64,
    ) -> &TokenEntry {
        self.step_number = self.step_number.saturating_add(1);
        self.phase_step_count = self.phase_step_count.saturating_add(1);
        self.entries.push(TokenEntry {
            model: model.into(),
            provider: provider.into(),
            phase,
            step_number: self.step_number,
            phase_step_count: self.phase_step_count,
            usage,
            cost_usd: cost_usd.max(0.0),
            recorded_unix_ms: vigil_core::unix_ms(),
        });
        self.entries.last().expect("entry just pushed")
    }

    /// Snapshots the entries recorded since the previous boundary and
    /// resets the phase-local step counter. Called immediately before a
    /// subprocess is killed for retry or fallback, never after.
    pub fn finalize_phase(&mut self) -> PhaseSnapshot {
        let entries: Vec<TokenEntry> = self.entries[self.phase_start_index..].to_vec();
        let total_tokens = entries.iter().map(|e| e.usage.total_tokens()).sum();
        let total_cost_usd = entries.iter().map(|e| e.cost_usd).sum();
        debug!(
            task_id = %self.task_id,
            steps = entries.len(),
            total_tokens,
            "finalized ledger phase"
        );
        self.phase_start_index = self.entries.len();
        self.phase_step_count = 0;
        PhaseSnapshot {
            entries,
            total_tokens,
            total_cost_usd,
        }
    }

    pub fn entries(&self) -> &[TokenEntry] {
        &self.entries
    }

    pub fn totals(&self) -> LedgerTotals {
        let mut totals = LedgerTotals {
            steps: self.entries.len() as u64,
            ..LedgerTotals::default()
        };
        for entry in &self.entries {
            totals.total_tokens = totals.total_tokens.saturating_add(entry.usage.total_tokens());
            totals.input_tokens = totals.input_tokens.saturating_add(entry.usage.input_tokens);
            totals.output_tokens = totals
                .output_tokens
                .saturating_add(entry.usage.output_tokens);
            totals.total_cost_usd += entry.cost_usd;
        }
        totals
    }

    /// Empties the ledger for a new task. Never called between phases.
    pub fn clear(&mut self, task_id: impl Into<String>) {
        self.task_id = task_id.into();
        self.session_id = None;
        self.entries.clear();
        self.step_number = 0;
        self.phase_step_count = 0;
        self.phase_start_index = 0;
    }

    /// Writes the usage report under `dir`, returning the file path.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let totals = self.totals();
        let report = UsageReport {
            task_id: self.task_id.clone(),
            session_id: self.session_id.clone(),
            written_at: Utc::now().to_rfc3339(),
            total_tokens: totals.total_tokens,
            total_cost_usd: totals.total_cost_usd,
            entries: self.entries.clone(),
        };
        let path = dir.join(format!("usage-{}.json", self.task_id));
        write_json_atomic(&path, &report)
            .with_context(|| format!("persist usage report for task '{}'", self.task_id))?;
        Ok(path)
    }
}
