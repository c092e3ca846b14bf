use std::sync::Arc;

use tracing::warn;

/// Callback fired on threshold crossings with the guard's state.
pub type CostCallback = Arc<dyn Fn(CostGuardState) + Send + Sync>;

/// Spend ceiling and warning threshold for one task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostGuardConfig {
    /// Hard spend ceiling in USD; zero or negative disables the guard.
    pub max_cost_usd: f64,
    /// Fraction of the ceiling at which the one-time warning fires.
    pub warn_fraction: f64,
}

impl Default for CostGuardConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 10.0,
            warn_fraction: 0.8,
        }
    }
}

/// Observable guard state, also the callback payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostGuardState {
    pub accumulated_usd: f64,
    pub max_cost_usd: f64,
    pub warned: bool,
    pub limit_reached: bool,
}

/// Circuit breaker over accumulated task spend.
///
/// `add_cost` keeps returning `false` once the ceiling is reached; the
/// trip is sticky until `reset`, which is called once per new task and
/// never between phases of the same task.
pub struct CostGuard {
    config: CostGuardConfig,
    accumulated_usd: f64,
    warned: bool,
    limit_reached: bool,
    on_warning: Option<CostCallback>,
    on_limit: Option<CostCallback>,
}

impl CostGuard {
    pub fn new(config: CostGuardConfig) -> Self {
        Self {
            config,
            accumulated_usd: 0.0,
            warned: false,
            limit_reached: false,
            on_warning: None,
            on_limit: None,
        }
    }

    pub fn with_callbacks(
        config: CostGuardConfig,
        on_warning: Option<CostCallback>,
        on_limit: Option<CostCallback>,
    ) -> Self {
        Self {
            on_warning,
            on_limit,
            ..Self::new(config)
        }
    }

    pub fn state(&self) -> CostGuardState {
        CostGuardState {
            accumulated_usd: self.accumulated_usd,
            max_cost_usd: self.config.max_cost_usd,
            warned: self.warned,
            limit_reached: self.limit_reached,
        }
    }

    /// Adds spend and reports whether the task may continue.
    pub fn add_cost(&mut self, cost_usd: f64) -> bool {
        if self.limit_reached {
            return false;
        }
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.accumulated_usd += cost_usd;
        }
        let max = self.config.max_cost_usd;
        if max <= 0.0 {
            return true;
        }

        if self.accumulated_usd >= max {
            self.limit_reached = true;
            warn!(
                accumulated_usd = self.accumulated_usd,
                max_cost_usd = max,
                "cost limit reached"
            );
            if let Some(on_limit) = &self.on_limit {
                on_limit(self.state());
            }
            return false;
        }

        if !self.warned && self.accumulated_usd >= max * self.config.warn_fraction.clamp(0.0, 1.0) {
            self.warned = true;
            if let Some(on_warning) = &self.on_warning {
                on_warning(self.state());
            }
        }
        true
    }

    /// Clears accumulation and both sticky flags for the next task.
    pub fn reset(&mut self) {
        self.accumulated_usd = 0.0;
        self.warned = false;
        self.limit_reached = false;
    }
}
