//! End-to-end hunt scenarios: submit, dequeue, execute, format.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hunt_engine::config::HuntConfig;
use hunt_engine::engine::executor::ExhaustiveExecutor;
use hunt_engine::engine::{AbortReason, Evaluator, HuntEngine, RegimeFlag, StableRegime};
use hunt_engine::grid::GridExpander;
use hunt_engine::output::{FormatOptions, HuntResult, HuntStatus, OutputFormatter, SortOrder};
use hunt_engine::queue::{DequeueMode, EnqueueStatus};
use hunt_engine::types::{GridLimits, Hypothesis, HypothesisDraft, HuntError, ParamValue};

use crate::stub_evaluators::{MockProbe, SumEvaluator};

fn config(concurrency: usize) -> HuntConfig {
    let mut cfg = HuntConfig::default();
    cfg.executor.concurrency = concurrency;
    cfg
}

fn approved(id: &str) -> Hypothesis {
    let mut draft = HypothesisDraft::sample_approved();
    draft.id = Some(id.to_string());
    Hypothesis::new(draft, &GridLimits::default()).unwrap()
}

async fn run(cfg: &HuntConfig, evaluator: SumEvaluator) -> HuntResult {
    let engine = HuntEngine::new(cfg);
    engine.submit(approved("hyp-run")).unwrap();
    let evaluator: Arc<dyn Evaluator> = Arc::new(evaluator);
    engine
        .run_next(
            DequeueMode::Fifo,
            evaluator,
            Arc::new(StableRegime),
            &FormatOptions::default(),
        )
        .await
        .expect("queue was not empty")
        .expect("run failed")
}

fn metric(result: &HuntResult, row: usize) -> f64 {
    result.rows()[row].metrics.as_ref().unwrap()["metric"]
}

/// Every object key in a JSON document, recursively.
fn collect_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                out.push(k.clone());
                collect_keys(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_keys(v, out)),
        _ => {}
    }
}

#[tokio::test]
async fn test_delay_mult_grid_complete_in_grid_order() {
    let result = run(&config(2), SumEvaluator::new()).await;

    assert_eq!(result.status(), HuntStatus::Complete);
    assert_eq!(result.total_variants(), 6);
    assert_eq!(result.variants_computed(), 6);
    assert_eq!(result.rows().len(), 6);
    assert_eq!(result.variants_skipped(), 0);
    assert_eq!(result.sort_order(), SortOrder::GridOrder);
    assert!(!result.shuffle_applied());

    let expected = [
        (0, 1.0),
        (0, 1.5),
        (15, 1.0),
        (15, 1.5),
        (30, 1.0),
        (30, 1.5),
    ];
    for (i, (delay, mult)) in expected.iter().enumerate() {
        let row = &result.rows()[i];
        assert_eq!(row.index, i);
        assert_eq!(row.params[0].dimension, "delay");
        assert_eq!(row.params[0].value, ParamValue::Int(*delay));
        assert_eq!(row.params[1].value, ParamValue::Float(*mult));
        assert_eq!(metric(&result, i), *delay as f64 + mult);
        assert!(row.evaluation_error.is_none());
    }

    let provenance = result.provenance();
    assert_eq!(provenance.evaluator_version, "sum-stub-1");
    assert_eq!(provenance.dataset_hash.as_deref(), Some("stub-dataset"));
    assert_eq!(provenance.input_hash.len(), 64);
    assert!(result.finished_at() >= result.started_at());
}

#[tokio::test]
async fn test_failure_at_index_three_stays_in_row() {
    let result = run(&config(3), SumEvaluator::failing_at(3)).await;

    assert_eq!(result.status(), HuntStatus::Complete);
    assert_eq!(result.variants_computed(), 6);
    for row in result.rows() {
        if row.index == 3 {
            assert!(row.metrics.is_none());
            let err = row.evaluation_error.as_deref().unwrap();
            assert!(err.contains("stub failure at index 3"), "{err}");
        } else {
            assert!(row.evaluation_error.is_none());
            assert!(row.metrics.is_some());
        }
    }
}

#[tokio::test]
async fn test_regime_change_after_k_variants() {
    for k in [0usize, 1, 4] {
        let evaluator = SumEvaluator::new();
        let completed = evaluator.completed();
        let probe = move || completed.load(Ordering::SeqCst) >= k;

        let exec = ExhaustiveExecutor::new(&config(1));
        let record = exec
            .run(approved("hyp-regime"), Arc::new(evaluator), Arc::new(probe))
            .await
            .unwrap();
        let result = OutputFormatter::format(&record, &FormatOptions::default());

        assert_eq!(result.status(), HuntStatus::Aborted, "k={k}");
        assert_eq!(result.variants_computed(), k);
        assert_eq!(result.variants_skipped(), 0);
        let mask = result.completeness_mask().unwrap();
        assert_eq!(mask.cells.len(), 6);
        for (i, cell) in mask.cells.iter().enumerate() {
            assert_eq!(*cell, i < k, "k={k} cell {i}");
        }
        let abort = result.abort().unwrap();
        assert_eq!(abort.reason, AbortReason::RegimeChange);
        assert!(abort.notice.starts_with("ABORTED: INCOMPLETE RESULT"));
    }
}

#[tokio::test]
async fn test_regime_flag_tripped_before_start() {
    let cfg = config(1);
    let flag = RegimeFlag::new();
    let tripper = flag.clone();
    tripper.trip();

    let exec = ExhaustiveExecutor::new(&cfg);
    let record = exec
        .run(approved("hyp-flag"), Arc::new(SumEvaluator::new()), Arc::new(flag))
        .await
        .unwrap();
    assert!(record.rows.is_empty());
    assert_eq!(record.abort, Some(AbortReason::RegimeChange));
}

#[tokio::test]
async fn test_mocked_probe_stops_dispatch() {
    // Stable for the first two dispatch checks, changed on the third.
    let calls = Arc::new(AtomicUsize::new(0));
    let mut probe = MockProbe::new();
    probe
        .expect_regime_changed()
        .times(3)
        .returning(move || calls.fetch_add(1, Ordering::SeqCst) >= 2);

    let mut cfg = config(1);
    cfg.executor.regime_poll_interval_ms = 3_600_000;
    let exec = ExhaustiveExecutor::new(&cfg);
    let record = exec
        .run(approved("hyp-mock"), Arc::new(SumEvaluator::new()), Arc::new(probe))
        .await
        .unwrap();
    let indices: Vec<usize> = record.rows.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_run_ceiling_aborts_incomplete() {
    let mut cfg = config(2);
    cfg.budget.max_run_secs = 5;
    cfg.budget.per_variant_timeout_secs = 4;
    let evaluator = SumEvaluator::new().with_delay(Duration::from_secs(3));

    let result = run(&cfg, evaluator).await;

    // Variants 0 and 1 start at t=0, 2 and 3 at t=3. The deadline at t=5
    // stops dispatch and the in-flight pair still finishes at t=6.
    assert_eq!(result.status(), HuntStatus::Aborted);
    assert_eq!(result.variants_computed(), 4);
    let mask = result.completeness_mask().unwrap();
    assert_eq!(mask.cells, vec![true, true, true, true, false, false]);
    assert!(matches!(
        result.abort().unwrap().reason,
        AbortReason::Budget { .. }
    ));
    let notice = &result.abort().unwrap().notice;
    assert!(notice.contains("4 of 6"), "{notice}");
    assert!(notice.contains("NOT computed"), "{notice}");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_after_last_dispatch_still_complete() {
    let mut cfg = config(3);
    cfg.budget.max_run_secs = 5;
    cfg.budget.per_variant_timeout_secs = 4;
    let evaluator = SumEvaluator::new().with_delay(Duration::from_secs(3));

    let result = run(&cfg, evaluator).await;

    // Variants 0-2 start at t=0 and 3-5 at t=3, so the grid is fully
    // dispatched before the t=5 deadline; the last batch ends at t=6.
    assert_eq!(result.status(), HuntStatus::Complete);
    assert_eq!(result.variants_computed(), 6);
    assert!(result.completeness_mask().is_none());
    assert!(result.abort().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_regime_change_after_last_dispatch_still_complete() {
    let mut cfg = config(6);
    cfg.executor.regime_poll_interval_ms = 50;
    let flag = RegimeFlag::new();
    let tripper = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tripper.trip();
    });

    let exec = ExhaustiveExecutor::new(&cfg);
    let evaluator = SumEvaluator::new().with_delay(Duration::from_secs(1));
    let record = exec
        .run(approved("hyp-late-regime"), Arc::new(evaluator), Arc::new(flag))
        .await
        .unwrap();
    let result = OutputFormatter::format(&record, &FormatOptions::default());

    assert_eq!(result.status(), HuntStatus::Complete);
    assert_eq!(result.variants_computed(), 6);
    assert!(result.abort().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_regime_change_with_variants_in_flight() {
    let mut cfg = config(2);
    cfg.executor.regime_poll_interval_ms = 250;
    let flag = RegimeFlag::new();
    let tripper = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_400)).await;
        tripper.trip();
    });

    let exec = ExhaustiveExecutor::new(&cfg);
    let evaluator = SumEvaluator::new().with_delay(Duration::from_secs(1));
    let record = exec
        .run(approved("hyp-in-flight"), Arc::new(evaluator), Arc::new(flag))
        .await
        .unwrap();
    let result = OutputFormatter::format(&record, &FormatOptions::default());

    // Variants 0 and 1 run t=0..1, 2 and 3 run t=1..2. The flag trips at
    // t=1.4: nothing new is dispatched and the in-flight pair is kept.
    assert_eq!(result.status(), HuntStatus::Aborted);
    let indices: Vec<usize> = result.rows().iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(result.variants_computed(), 4);
    let mask = result.completeness_mask().unwrap();
    assert_eq!(mask.cells, vec![true, true, true, true, false, false]);
    assert_eq!(mask.computed_region, "grid indices 0-3 (4 variants)");
    let abort = result.abort().unwrap();
    assert_eq!(abort.reason, AbortReason::RegimeChange);
    assert!(abort.notice.contains("4 of 6"), "{}", abort.notice);
}

#[tokio::test]
async fn test_same_rows_regardless_of_concurrency() {
    let sequential = run(&config(1), SumEvaluator::new()).await;
    let parallel = run(&config(4), SumEvaluator::new()).await;

    let key = |r: &HuntResult| {
        r.rows()
            .iter()
            .map(|row| (row.index, row.variant_id.clone(), row.params.clone(), row.metrics.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&sequential), key(&parallel));

    let h = approved("hyp-expand");
    assert_eq!(GridExpander::expand(&h).unwrap(), GridExpander::expand(&h).unwrap());
}

#[tokio::test]
async fn test_reformatting_is_idempotent() {
    let exec = ExhaustiveExecutor::new(&config(2));
    let record = exec
        .run(approved("hyp-fmt"), Arc::new(SumEvaluator::new()), Arc::new(StableRegime))
        .await
        .unwrap();
    let a = OutputFormatter::format(&record, &FormatOptions::default());
    let b = OutputFormatter::format(&record, &FormatOptions::default());
    assert_eq!(a, b);
    assert_eq!(a.to_json_pretty().unwrap(), b.to_json_pretty().unwrap());
}

#[tokio::test]
async fn test_explicit_shuffle_is_declared() {
    let exec = ExhaustiveExecutor::new(&config(2));
    let record = exec
        .run(approved("hyp-shuffle"), Arc::new(SumEvaluator::new()), Arc::new(StableRegime))
        .await
        .unwrap();
    let result = OutputFormatter::format(
        &record,
        &FormatOptions {
            shuffle_seed: Some(7),
        },
    );
    assert_eq!(result.sort_order(), SortOrder::Shuffled);
    assert!(result.shuffle_applied());
    assert_eq!(result.rows().len(), 6);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["sort_order"], "SHUFFLED");
    assert_eq!(json["shuffle_seed"], 7);
}

#[tokio::test]
async fn test_result_schema_has_no_ranking_fields() {
    let complete = run(&config(2), SumEvaluator::new()).await;

    let evaluator = SumEvaluator::new();
    let completed = evaluator.completed();
    let exec = ExhaustiveExecutor::new(&config(1));
    let record = exec
        .run(
            approved("hyp-aborted"),
            Arc::new(evaluator),
            Arc::new(move || completed.load(Ordering::SeqCst) >= 2),
        )
        .await
        .unwrap();
    let aborted = OutputFormatter::format(&record, &FormatOptions::default());

    for result in [&complete, &aborted] {
        let mut keys = Vec::new();
        collect_keys(&serde_json::to_value(result).unwrap(), &mut keys);
        assert!(!keys.is_empty());
        for key in keys {
            let lower = key.to_lowercase();
            for banned in ["best", "top", "rank", "priority", "score", "recommended"] {
                assert!(!lower.contains(banned), "field '{key}' contains '{banned}'");
            }
        }
    }
}

#[tokio::test]
async fn test_unapproved_enqueue_fails() {
    let engine = HuntEngine::new(&config(1));
    let hyp = Hypothesis::new(HypothesisDraft::sample(), &GridLimits::default()).unwrap();
    let err = engine.queue().enqueue(hyp).unwrap_err();
    assert!(matches!(err, HuntError::Approval(_)));
    assert!(engine.queue().is_empty());
}

#[tokio::test]
async fn test_budget_boundary_on_submit() {
    let engine = HuntEngine::new(&config(1));

    let mut at_limit = HypothesisDraft::sample_approved();
    at_limit.id = Some("hyp-at-limit".into());
    at_limit.budget.max_variants = 6;
    let at_limit = Hypothesis::new(at_limit, &GridLimits::default()).unwrap();
    tokio_test::assert_ok!(engine.submit(at_limit));

    let mut over = HypothesisDraft::sample_approved();
    over.id = Some("hyp-over".into());
    over.budget.max_variants = 5;
    let over = Hypothesis::new(over, &GridLimits::default()).unwrap();
    match engine.submit(over) {
        Err(HuntError::BudgetRejected { suggestion, .. }) => {
            assert!(suggestion.contains("delay"), "{suggestion}");
        }
        other => panic!("expected budget rejection, got {other:?}"),
    }
    assert_eq!(engine.queue().len(), 1);
}

#[test]
fn test_priority_field_rejected_from_json() {
    let doc = r#"{
        "question": "q",
        "grid": [{"name": "x", "values": [1, 2]}],
        "metrics": ["m"],
        "budget": {"max_variants": 10},
        "author": {"kind": "human", "name": "a"},
        "priority": 1
    }"#;
    match Hypothesis::from_json(doc, &GridLimits::default()) {
        Err(HuntError::Validation { field, .. }) => assert_eq!(field, "priority"),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_rate_limit_returns_status() {
    let mut cfg = config(1);
    cfg.queue.max_enqueues_per_hour = 2;
    let engine = HuntEngine::new(&cfg);
    let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();

    for (i, id) in ["hyp-a", "hyp-b"].iter().enumerate() {
        let status = engine
            .queue()
            .enqueue_at(approved(id), t0 + ChronoDuration::minutes(i as i64))
            .unwrap();
        assert!(matches!(status, EnqueueStatus::Queued { .. }));
    }

    let status = engine
        .queue()
        .enqueue_at(approved("hyp-c"), t0 + ChronoDuration::minutes(10))
        .unwrap();
    assert!(matches!(status, EnqueueStatus::RateLimit { limit: 2, .. }));
    assert_eq!(engine.queue().len(), 2);

    let status = engine
        .queue()
        .enqueue_at(approved("hyp-c"), t0 + ChronoDuration::minutes(61))
        .unwrap();
    assert!(matches!(status, EnqueueStatus::Queued { pending: 3, .. }));
}

#[tokio::test]
async fn test_fifo_runs_oldest_first() {
    let engine = HuntEngine::new(&config(2));
    let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
    engine
        .queue()
        .enqueue_at(approved("hyp-second"), t0 + ChronoDuration::seconds(5))
        .unwrap();
    engine.queue().enqueue_at(approved("hyp-first"), t0).unwrap();

    let mut order = Vec::new();
    while let Some(result) = engine
        .run_next(
            DequeueMode::Fifo,
            Arc::new(SumEvaluator::new()),
            Arc::new(StableRegime),
            &FormatOptions::default(),
        )
        .await
    {
        order.push(result.unwrap().hypothesis_id().to_string());
    }
    assert_eq!(order, vec!["hyp-first", "hyp-second"]);
}
