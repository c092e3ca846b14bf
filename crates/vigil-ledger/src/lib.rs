//! Token/cost accounting for one supervised task.
//!
//! The ledger is append-only for the lifetime of a task and tags every
//! entry with the execution phase that produced it; the cost guard is a
//! sticky circuit breaker over the ledger's running spend.

pub mod cost_guard;
pub mod ledger;

pub use cost_guard::{CostCallback, CostGuard, CostGuardConfig, CostGuardState};
pub use ledger::{
    ExecutionPhase, LedgerTotals, PhaseSnapshot, StepUsage, TokenEntry, TokenLedger, UsageReport,
};
