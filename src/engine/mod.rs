//! Hunt engine: evaluator and regime-probe seams, the exhaustive executor
//! and the submit → dequeue → run → format orchestration.

pub mod executor;
pub mod state;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::budget::{BudgetBreach, BudgetEstimate};
use crate::config::HuntConfig;
use crate::output::{FormatOptions, HuntResult, OutputFormatter};
use crate::queue::{DequeueMode, EnqueueStatus, HuntQueue};
use crate::types::{Constraints, Hypothesis, HuntError, Metrics, ParamSet, Variant};

use executor::ExhaustiveExecutor;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Computes metrics for one variant. Supplied by the caller; the engine
/// never looks inside.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        variant: &Variant,
        fixed_params: &ParamSet,
        constraints: &Constraints,
    ) -> Result<Metrics>;

    /// Recorded in result provenance.
    fn version(&self) -> &str;

    fn dataset_hash(&self) -> Option<String> {
        None
    }
}

/// Zero-argument "has the regime changed?" check, polled between variants.
#[cfg_attr(test, mockall::automock)]
pub trait RegimeProbe: Send + Sync {
    fn regime_changed(&self) -> bool;
}

impl<F> RegimeProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn regime_changed(&self) -> bool {
        self()
    }
}

/// Probe for callers with no regime monitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableRegime;

impl RegimeProbe for StableRegime {
    fn regime_changed(&self) -> bool {
        false
    }
}

/// Shared flag an external monitor can trip mid-run.
#[derive(Debug, Clone, Default)]
pub struct RegimeFlag(Arc<AtomicBool>);

impl RegimeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl RegimeProbe for RegimeFlag {
    fn regime_changed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Abort and per-variant failure
// ---------------------------------------------------------------------------

/// Why a run stopped before covering the grid. Not an error: an aborted
/// run is a valid terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortReason {
    Budget { breach: BudgetBreach },
    RegimeChange,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Budget { breach } => write!(f, "budget exceeded: {breach}"),
            AbortReason::RegimeChange => write!(f, "regime change detected"),
        }
    }
}

/// One variant's evaluation failure. Recorded in its row; never aborts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("evaluator failed: {0}")]
    Failed(String),

    #[error("evaluation timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("evaluator panicked: {0}")]
    Panicked(String),

    #[error("evaluator did not return requested metrics: {}", .0.join(", "))]
    MissingMetrics(Vec<String>),
}

// ---------------------------------------------------------------------------
// Dry-run evaluator
// ---------------------------------------------------------------------------

/// Evaluator that computes nothing: logs each variant and reports zero for
/// every requested metric. Used by the CLI `run` command.
pub struct DryRunEvaluator {
    metrics: Vec<String>,
}

impl DryRunEvaluator {
    pub fn new(metrics: &[String]) -> Self {
        Self {
            metrics: metrics.to_vec(),
        }
    }
}

#[async_trait]
impl Evaluator for DryRunEvaluator {
    async fn evaluate(
        &self,
        variant: &Variant,
        _fixed_params: &ParamSet,
        _constraints: &Constraints,
    ) -> Result<Metrics> {
        info!(
            variant_id = %variant.variant_id,
            variant = %variant,
            "[DRY RUN] Would evaluate variant"
        );
        Ok(self.metrics.iter().map(|m| (m.clone(), 0.0)).collect())
    }

    fn version(&self) -> &str {
        "dry-run"
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Queue, executor and formatter wired together.
pub struct HuntEngine {
    queue: HuntQueue,
    executor: ExhaustiveExecutor,
}

impl HuntEngine {
    pub fn new(config: &HuntConfig) -> Self {
        Self {
            queue: HuntQueue::new(&config.queue, config.grid_limits()),
            executor: ExhaustiveExecutor::new(config),
        }
    }

    pub fn queue(&self) -> &HuntQueue {
        &self.queue
    }

    pub fn executor(&self) -> &ExhaustiveExecutor {
        &self.executor
    }

    /// Price the hypothesis, then enqueue it. A budget rejection never
    /// reaches the queue.
    pub fn submit(&self, hypothesis: Hypothesis) -> Result<EnqueueStatus, HuntError> {
        let estimate: BudgetEstimate = self
            .executor
            .enforcer()
            .check_pre_execution(&hypothesis)
            .into_result()?;
        debug!(
            hypothesis_id = %hypothesis.id(),
            total = estimate.total_variants,
            "Submitting hypothesis"
        );
        self.queue.enqueue(hypothesis)
    }

    /// Run one already-dequeued hypothesis and format the result.
    pub async fn run_one(
        &self,
        hypothesis: Hypothesis,
        evaluator: Arc<dyn Evaluator>,
        probe: Arc<dyn RegimeProbe>,
        options: &FormatOptions,
    ) -> Result<HuntResult, HuntError> {
        let record = self.executor.run(hypothesis, evaluator, probe).await?;
        Ok(OutputFormatter::format(&record, options))
    }

    /// Dequeue the next hypothesis and run it. `None` when the queue is
    /// empty.
    pub async fn run_next(
        &self,
        mode: DequeueMode,
        evaluator: Arc<dyn Evaluator>,
        probe: Arc<dyn RegimeProbe>,
        options: &FormatOptions,
    ) -> Option<Result<HuntResult, HuntError>> {
        let hypothesis = self.queue.dequeue(mode)?;
        Some(self.run_one(hypothesis, evaluator, probe, options).await)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
