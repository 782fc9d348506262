//! Stub evaluators for integration testing.
//!
//! Deterministic `Evaluator` implementations whose metrics are simple
//! functions of the variant parameters, plus a mockable regime probe.
//! All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hunt_engine::engine::{Evaluator, RegimeProbe};
use hunt_engine::types::{Constraints, Metrics, ParamSet, Variant};

mockall::mock! {
    pub Probe {}
    impl RegimeProbe for Probe {
        fn regime_changed(&self) -> bool;
    }
}

/// `{metric: sum of numeric parameters}`, e.g. delay + mult.
///
/// Optionally fails on one grid index, sleeps per variant, and counts
/// completed evaluations.
pub struct SumEvaluator {
    fail_at: Option<usize>,
    delay: Option<Duration>,
    completed: Arc<AtomicUsize>,
}

impl SumEvaluator {
    pub fn new() -> Self {
        Self {
            fail_at: None,
            delay: None,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return an error for the variant at `index`.
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::new()
        }
    }

    /// Sleep this long inside every evaluation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared count of finished evaluations.
    pub fn completed(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.completed)
    }
}

#[async_trait]
impl Evaluator for SumEvaluator {
    async fn evaluate(
        &self,
        variant: &Variant,
        _fixed_params: &ParamSet,
        _constraints: &Constraints,
    ) -> Result<Metrics> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = if self.fail_at == Some(variant.index) {
            Err(anyhow!("stub failure at index {}", variant.index))
        } else {
            let sum: f64 = variant
                .params
                .iter()
                .filter_map(|b| b.value.as_f64())
                .sum();
            Ok(Metrics::from([("metric".to_string(), sum)]))
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn version(&self) -> &str {
        "sum-stub-1"
    }

    fn dataset_hash(&self) -> Option<String> {
        Some("stub-dataset".to_string())
    }
}
