//! Budget estimation and enforcement.
//!
//! `BudgetEstimator` prices a hypothesis before anything runs.
//! `BudgetEnforcer` turns the estimate into an APPROVED / WARNING / REJECTED
//! decision and, once a run starts, watches wall-clock time and variants
//! processed against the configured ceilings. Neither ever mutates the
//! hypothesis; the enforcer's only effect is raising a cancellation signal
//! on the run's `ExecutionHandle`.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{BudgetConfig, MAX_RUN_SECS};
use crate::grid::GridExpander;
use crate::types::{Hypothesis, HuntError};

// ---------------------------------------------------------------------------
// Estimate
// ---------------------------------------------------------------------------

/// Pre-execution price of a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetEstimate {
    pub total_variants: u64,
    pub estimated_compute_seconds: f64,
    pub within_budget: bool,
}

impl fmt::Display for BudgetEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} variants, ~{:.1}s compute ({})",
            self.total_variants,
            self.estimated_compute_seconds,
            if self.within_budget { "within budget" } else { "over budget" },
        )
    }
}

pub struct BudgetEstimator {
    secs_per_variant: f64,
    concurrency: usize,
    system_max_variants: u64,
}

impl BudgetEstimator {
    pub fn new(config: &BudgetConfig, concurrency: usize) -> Self {
        Self {
            secs_per_variant: config.estimated_secs_per_variant,
            concurrency: concurrency.max(1),
            system_max_variants: config.system_max_variants,
        }
    }

    /// Total variants = product of cardinalities; compute time assumes the
    /// worker pool stays saturated.
    pub fn estimate(&self, hypothesis: &Hypothesis) -> BudgetEstimate {
        let total_variants = GridExpander::count(hypothesis.grid());
        let budget = hypothesis.budget();
        let within_system =
            total_variants <= self.system_max_variants || budget.override_system_ceiling;
        BudgetEstimate {
            total_variants,
            estimated_compute_seconds: total_variants as f64 * self.secs_per_variant
                / self.concurrency as f64,
            within_budget: total_variants <= budget.max_variants && within_system,
        }
    }
}

// ---------------------------------------------------------------------------
// Pre-execution decision
// ---------------------------------------------------------------------------

/// Outcome of the pre-execution budget check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetDecision {
    Approved {
        estimate: BudgetEstimate,
    },
    /// Allowed to run, with caveats the caller should see.
    Warning {
        estimate: BudgetEstimate,
        warnings: Vec<String>,
    },
    Rejected {
        estimate: BudgetEstimate,
        reason: String,
        suggestion: String,
    },
}

impl BudgetDecision {
    pub fn estimate(&self) -> &BudgetEstimate {
        match self {
            BudgetDecision::Approved { estimate }
            | BudgetDecision::Warning { estimate, .. }
            | BudgetDecision::Rejected { estimate, .. } => estimate,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BudgetDecision::Rejected { .. })
    }

    /// Rejections become `HuntError::BudgetRejected`; anything else yields
    /// the estimate.
    pub fn into_result(self) -> Result<BudgetEstimate, HuntError> {
        match self {
            BudgetDecision::Approved { estimate } | BudgetDecision::Warning { estimate, .. } => {
                Ok(estimate)
            }
            BudgetDecision::Rejected {
                reason, suggestion, ..
            } => Err(HuntError::BudgetRejected { reason, suggestion }),
        }
    }
}

// ---------------------------------------------------------------------------
// During-execution monitoring
// ---------------------------------------------------------------------------

/// Which run ceiling was breached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "ceiling", rename_all = "snake_case")]
pub enum BudgetBreach {
    Time { elapsed_ms: u64, limit_ms: u64 },
    Variants { processed: u64, limit: u64 },
}

impl fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetBreach::Time {
                elapsed_ms,
                limit_ms,
            } => write!(f, "run time ceiling reached ({elapsed_ms}ms of {limit_ms}ms)"),
            BudgetBreach::Variants { processed, limit } => {
                write!(f, "variant ceiling reached ({processed} of {limit})")
            }
        }
    }
}

/// Per-run budget state, owned by the coordinating task.
#[derive(Debug)]
pub struct ExecutionHandle {
    started: Instant,
    deadline: Instant,
    max_run: Duration,
    variant_limit: u64,
    processed: u64,
    cancelled: Option<BudgetBreach>,
}

impl ExecutionHandle {
    /// Count one variant handed to an evaluator.
    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn variant_limit(&self) -> u64 {
        self.variant_limit
    }

    /// The cancellation signal, once raised.
    pub fn cancellation(&self) -> Option<&BudgetBreach> {
        self.cancelled.as_ref()
    }
}

pub struct BudgetEnforcer {
    estimator: BudgetEstimator,
    max_run: Duration,
    system_max_variants: u64,
}

impl BudgetEnforcer {
    pub fn new(config: &BudgetConfig, concurrency: usize) -> Self {
        Self {
            estimator: BudgetEstimator::new(config, concurrency),
            max_run: config.max_run().min(Duration::from_secs(MAX_RUN_SECS)),
            system_max_variants: config.system_max_variants,
        }
    }

    pub fn estimator(&self) -> &BudgetEstimator {
        &self.estimator
    }

    /// Compare the estimate against the hypothesis budget and the
    /// system-wide ceiling.
    ///
    /// A grid exactly at `max_variants` is approved; one more is rejected.
    pub fn check_pre_execution(&self, hypothesis: &Hypothesis) -> BudgetDecision {
        let estimate = self.estimator.estimate(hypothesis);
        let budget = hypothesis.budget();
        let total = estimate.total_variants;

        let decision = if total > budget.max_variants {
            BudgetDecision::Rejected {
                reason: format!(
                    "grid expands to {total} variants, budget.max_variants is {}",
                    budget.max_variants
                ),
                suggestion: shrink_suggestion(hypothesis, total, budget.max_variants),
                estimate,
            }
        } else if total > self.system_max_variants && !budget.override_system_ceiling {
            BudgetDecision::Rejected {
                reason: format!(
                    "grid expands to {total} variants, system ceiling is {}",
                    self.system_max_variants
                ),
                suggestion: format!(
                    "{}; or set budget.override_system_ceiling = true",
                    shrink_suggestion(hypothesis, total, self.system_max_variants)
                ),
                estimate,
            }
        } else {
            let mut warnings = Vec::new();
            if total > self.system_max_variants {
                warnings.push(format!(
                    "system ceiling of {} variants exceeded under explicit override",
                    self.system_max_variants
                ));
            }
            if estimate.estimated_compute_seconds > self.max_run.as_secs_f64() {
                warnings.push(format!(
                    "estimated {:.0}s exceeds the {}s run ceiling; the run is likely to abort incomplete",
                    estimate.estimated_compute_seconds,
                    self.max_run.as_secs()
                ));
            }
            if warnings.is_empty() {
                BudgetDecision::Approved { estimate }
            } else {
                BudgetDecision::Warning { estimate, warnings }
            }
        };

        match &decision {
            BudgetDecision::Approved { estimate } => info!(
                hypothesis_id = %hypothesis.id(),
                total = estimate.total_variants,
                est_secs = format!("{:.1}", estimate.estimated_compute_seconds),
                "Budget approved"
            ),
            BudgetDecision::Warning { warnings, .. } => warn!(
                hypothesis_id = %hypothesis.id(),
                warnings = ?warnings,
                "Budget approved with warnings"
            ),
            BudgetDecision::Rejected { reason, .. } => warn!(
                hypothesis_id = %hypothesis.id(),
                reason = %reason,
                "Budget rejected"
            ),
        }

        decision
    }

    /// Start the clock for a run.
    pub fn begin(&self, hypothesis: &Hypothesis) -> ExecutionHandle {
        let budget = hypothesis.budget();
        let variant_limit = if budget.override_system_ceiling {
            budget.max_variants
        } else {
            budget.max_variants.min(self.system_max_variants)
        };
        let started = Instant::now();
        ExecutionHandle {
            started,
            deadline: started + self.max_run,
            max_run: self.max_run,
            variant_limit,
            processed: 0,
            cancelled: None,
        }
    }

    /// Check the run ceilings. Raises (and returns) the cancellation signal
    /// when elapsed time reaches the run ceiling or the processed count
    /// reaches the variant limit. Once raised, the signal sticks.
    pub fn enforce_during(&self, handle: &mut ExecutionHandle) -> Option<BudgetBreach> {
        if let Some(breach) = &handle.cancelled {
            return Some(breach.clone());
        }

        let elapsed = handle.elapsed();
        let breach = if elapsed >= handle.max_run {
            Some(BudgetBreach::Time {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: handle.max_run.as_millis() as u64,
            })
        } else if handle.processed >= handle.variant_limit {
            Some(BudgetBreach::Variants {
                processed: handle.processed,
                limit: handle.variant_limit,
            })
        } else {
            None
        };

        if let Some(b) = &breach {
            warn!(breach = %b, "Budget ceiling breached, cancelling run");
            handle.cancelled = Some(b.clone());
        }
        breach
    }
}

/// Concrete advice for bringing `total` down to `limit`: shrink the
/// largest dimension, or raise the declared budget.
fn shrink_suggestion(hypothesis: &Hypothesis, total: u64, limit: u64) -> String {
    let largest = hypothesis
        .grid()
        .iter()
        .max_by_key(|d| d.cardinality());

    if let Some(dim) = largest {
        let card = dim.cardinality() as u64;
        let others = (total / card.max(1)).max(1);
        let fit = limit / others;
        if fit >= 1 {
            return format!(
                "reduce dimension '{}' from {card} to at most {fit} values, or raise budget.max_variants to {total}",
                dim.name
            );
        }
    }
    format!("raise budget.max_variants to {total} or remove a dimension")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
