//! Exhaustive executor.
//!
//! Drives one hypothesis through every variant of its grid. A single
//! coordinating task owns the accumulator; evaluations run on spawned
//! workers (at most `concurrency` at a time) and report back over a
//! channel. Dispatch follows grid order and rows are reassembled by grid
//! index, so the output never depends on completion order.
//!
//! Before each dispatch the coordinator polls the budget enforcer and the
//! regime probe. While variants remain undispatched it also wakes on the
//! run deadline and on a regime poll interval. Once either signals stop, no
//! new variant is dispatched; in-flight evaluations finish or hit their
//! per-variant timeout and are kept. A stop signal after the last dispatch
//! has nothing to cancel and leaves the run COMPLETE.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::state::RunState;
use super::{AbortReason, EvaluationError, Evaluator, RegimeProbe};
use crate::budget::BudgetEnforcer;
use crate::config::{HuntConfig, MAX_RUN_SECS};
use crate::grid::GridExpander;
use crate::output::VariantResult;
use crate::types::{Constraints, Hypothesis, HuntError, Metrics, ParamSet, Variant};

// ---------------------------------------------------------------------------
// Run record
// ---------------------------------------------------------------------------

/// Raw outcome of one run, before formatting.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub hypothesis_id: String,
    pub question: String,
    pub input_hash: String,
    pub evaluator_version: String,
    pub dataset_hash: Option<String>,
    pub total_variants: usize,
    /// Always terminal.
    pub state: RunState,
    pub abort: Option<AbortReason>,
    /// Computed rows in grid order.
    pub rows: Vec<VariantResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Message from a worker to the coordinator.
struct VariantOutcome {
    variant: Variant,
    result: Result<Metrics, EvaluationError>,
    elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ExhaustiveExecutor {
    enforcer: BudgetEnforcer,
    concurrency: usize,
    per_variant_timeout: Duration,
    regime_poll_interval: Duration,
}

impl ExhaustiveExecutor {
    pub fn new(config: &HuntConfig) -> Self {
        let concurrency = config.executor.concurrency.max(1);
        Self {
            enforcer: BudgetEnforcer::new(&config.budget, concurrency),
            concurrency,
            per_variant_timeout: config.budget.per_variant_timeout(),
            regime_poll_interval: config
                .executor
                .regime_poll_interval()
                .min(Duration::from_secs(MAX_RUN_SECS)),
        }
    }

    pub fn enforcer(&self) -> &BudgetEnforcer {
        &self.enforcer
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every variant of an approved hypothesis.
    ///
    /// Returns `Err` only for failures detected before the first variant
    /// (approval, budget pre-check, grid). Anything that happens after that
    /// ends in a terminal `RunRecord`, either COMPLETE or ABORTED.
    pub async fn run(
        &self,
        hypothesis: Hypothesis,
        evaluator: Arc<dyn Evaluator>,
        probe: Arc<dyn RegimeProbe>,
    ) -> Result<RunRecord, HuntError> {
        if !hypothesis.is_approved() {
            return Err(HuntError::Approval(format!(
                "hypothesis '{}' has not been approved",
                hypothesis.id()
            )));
        }
        let estimate = self.enforcer.check_pre_execution(&hypothesis).into_result()?;
        let expansion = GridExpander::expand(&hypothesis)?;
        let total = expansion.total;

        let mut state = RunState::Pending;
        let started_at = Utc::now();
        let mut handle = self.enforcer.begin(&hypothesis);
        state = state.transition(RunState::Running)?;

        info!(
            hypothesis_id = %hypothesis.id(),
            total,
            est_secs = format!("{:.1}", estimate.estimated_compute_seconds),
            concurrency = self.concurrency,
            evaluator = evaluator.version(),
            "Hunt run started"
        );

        let fixed = Arc::new(hypothesis.fixed_params().clone());
        let constraints = Arc::new(hypothesis.constraints().clone());
        let requested = Arc::new(hypothesis.metrics().to_vec());

        let (tx, mut rx) = mpsc::channel::<VariantOutcome>(self.concurrency);
        // Dropping the set (run finished or the caller dropped this future)
        // aborts any evaluation still running.
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut slots: Vec<Option<VariantResult>> = vec![None; total];
        let mut pending = expansion.variants.into_iter().peekable();
        let mut in_flight = 0usize;
        let mut abort: Option<AbortReason> = None;

        let mut regime_tick = tokio::time::interval_at(
            Instant::now() + self.regime_poll_interval,
            self.regime_poll_interval,
        );
        regime_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Dispatch in grid order up to the pool size.
            while abort.is_none() && in_flight < self.concurrency && pending.peek().is_some() {
                if let Some(breach) = self.enforcer.enforce_during(&mut handle) {
                    abort = Some(AbortReason::Budget { breach });
                    break;
                }
                if probe.regime_changed() {
                    abort = Some(AbortReason::RegimeChange);
                    break;
                }
                let Some(variant) = pending.next() else {
                    break;
                };
                handle.record_processed();
                in_flight += 1;
                debug!(index = variant.index, variant = %variant, "Dispatching variant");
                self.spawn_evaluation(
                    &mut workers,
                    variant,
                    Arc::clone(&evaluator),
                    Arc::clone(&fixed),
                    Arc::clone(&constraints),
                    Arc::clone(&requested),
                    tx.clone(),
                );
            }

            if in_flight == 0 {
                break;
            }

            // Once every variant is dispatched there is nothing left to
            // cancel; the run completes when the last result arrives.
            let cancellable = abort.is_none() && pending.peek().is_some();

            tokio::select! {
                Some(outcome) = rx.recv() => {
                    in_flight -= 1;
                    while workers.try_join_next().is_some() {}
                    let row = into_row(outcome);
                    if let Some(err) = &row.evaluation_error {
                        warn!(
                            hypothesis_id = %hypothesis.id(),
                            index = row.index,
                            error = %err,
                            "Variant evaluation failed"
                        );
                    }
                    let index = row.index;
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(row);
                    }
                }
                _ = sleep_until(handle.deadline()), if cancellable => {
                    if let Some(breach) = self.enforcer.enforce_during(&mut handle) {
                        abort = Some(AbortReason::Budget { breach });
                    }
                }
                _ = regime_tick.tick(), if cancellable => {
                    if probe.regime_changed() {
                        abort = Some(AbortReason::RegimeChange);
                    }
                }
            }
        }

        let rows: Vec<VariantResult> = slots.into_iter().flatten().collect();
        let finished_at = Utc::now();

        state = match &abort {
            None => state.transition(RunState::Complete)?,
            Some(reason) => {
                warn!(
                    hypothesis_id = %hypothesis.id(),
                    reason = %reason,
                    computed = rows.len(),
                    total,
                    "Hunt run aborted, result is incomplete"
                );
                state.transition(RunState::Aborted)?
            }
        };

        info!(
            hypothesis_id = %hypothesis.id(),
            state = %state,
            computed = rows.len(),
            total,
            elapsed_ms = handle.elapsed().as_millis() as u64,
            "Hunt run finished"
        );

        Ok(RunRecord {
            hypothesis_id: hypothesis.id().to_string(),
            question: hypothesis.question().to_string(),
            input_hash: hypothesis.input_hash(),
            evaluator_version: evaluator.version().to_string(),
            dataset_hash: evaluator.dataset_hash(),
            total_variants: total,
            state,
            abort,
            rows,
            started_at,
            finished_at,
        })
    }

    fn spawn_evaluation(
        &self,
        workers: &mut JoinSet<()>,
        variant: Variant,
        evaluator: Arc<dyn Evaluator>,
        fixed: Arc<ParamSet>,
        constraints: Arc<Constraints>,
        requested: Arc<Vec<String>>,
        tx: mpsc::Sender<VariantOutcome>,
    ) {
        let timeout = self.per_variant_timeout;
        workers.spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(evaluator.evaluate(&variant, &fixed, &constraints))
                .catch_unwind();
            let result = match tokio::time::timeout(timeout, call).await {
                Err(_) => Err(EvaluationError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                }),
                Ok(Err(panic)) => Err(EvaluationError::Panicked(panic_message(panic))),
                Ok(Ok(Err(e))) => Err(EvaluationError::Failed(format!("{e:#}"))),
                Ok(Ok(Ok(metrics))) => select_metrics(metrics, &requested),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            // The coordinator keeps its receiver until every in-flight
            // variant has reported.
            let _ = tx
                .send(VariantOutcome {
                    variant,
                    result,
                    elapsed_ms,
                })
                .await;
        });
    }
}

/// Keep exactly the requested metrics; any missing one fails the row.
fn select_metrics(mut metrics: Metrics, requested: &[String]) -> Result<Metrics, EvaluationError> {
    let missing: Vec<String> = requested
        .iter()
        .filter(|m| !metrics.contains_key(*m))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(EvaluationError::MissingMetrics(missing));
    }
    metrics.retain(|name, _| requested.contains(name));
    Ok(metrics)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn into_row(outcome: VariantOutcome) -> VariantResult {
    let (metrics, evaluation_error) = match outcome.result {
        Ok(metrics) => (Some(metrics), None),
        Err(e) => (None, Some(e.to_string())),
    };
    VariantResult {
        index: outcome.variant.index,
        variant_id: outcome.variant.variant_id,
        params: outcome.variant.params,
        metrics,
        evaluation_error,
        elapsed_ms: outcome.elapsed_ms,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
