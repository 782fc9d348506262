//! Output formatting.
//!
//! Assembles the immutable `HuntResult` from an executor `RunRecord`.
//! Every computed row is emitted, in grid order, with no flag, highlight
//! or filter derived from metric values. The schema has no ranking,
//! recommendation or confidence field at all. The only permitted
//! reordering is an explicit, seeded, post-hoc shuffle, which is declared
//! in `sort_order` and `shuffle_applied`.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::engine::executor::RunRecord;
use crate::engine::state::RunState;
use crate::engine::AbortReason;
use crate::types::{Metrics, ParamBinding};

// ---------------------------------------------------------------------------
// Row and document schema
// ---------------------------------------------------------------------------

/// Outcome of evaluating one variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantResult {
    /// Grid-order position.
    pub index: usize,
    pub variant_id: String,
    pub params: Vec<ParamBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    /// Present when this variant's evaluation failed. Failures stay in
    /// their row; they never abort the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HuntStatus {
    Complete,
    Aborted,
}

impl fmt::Display for HuntStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HuntStatus::Complete => write!(f, "COMPLETE"),
            HuntStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Declared row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    #[serde(rename = "GRID_ORDER")]
    GridOrder,
    #[serde(rename = "SHUFFLED")]
    Shuffled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub input_hash: String,
    pub evaluator_version: String,
    pub dataset_hash: Option<String>,
}

/// Which grid cells were computed before an abort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletenessMask {
    /// Aligned to grid-order indices.
    pub cells: Vec<bool>,
    pub computed_region: String,
    pub uncomputed_region: String,
}

impl CompletenessMask {
    pub fn from_cells(cells: Vec<bool>) -> Self {
        let computed_region = describe_region(&cells, true);
        let uncomputed_region = describe_region(&cells, false);
        Self {
            cells,
            computed_region,
            uncomputed_region,
        }
    }

    pub fn computed_count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }
}

/// Literal statement attached to every aborted result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortNotice {
    pub reason: AbortReason,
    pub notice: String,
}

/// Final, immutable hunt document. Owned by the caller once returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HuntResult {
    hypothesis_id: String,
    question: String,
    status: HuntStatus,
    total_variants: usize,
    variants_computed: usize,
    variants_skipped: usize,
    sort_order: SortOrder,
    shuffle_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    shuffle_seed: Option<u64>,
    rows: Vec<VariantResult>,
    provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    completeness_mask: Option<CompletenessMask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abort: Option<AbortNotice>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl HuntResult {
    pub fn hypothesis_id(&self) -> &str {
        &self.hypothesis_id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn status(&self) -> HuntStatus {
        self.status
    }

    pub fn total_variants(&self) -> usize {
        self.total_variants
    }

    pub fn variants_computed(&self) -> usize {
        self.variants_computed
    }

    /// Always zero: a variant is either computed or the run aborted.
    pub fn variants_skipped(&self) -> usize {
        self.variants_skipped
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn shuffle_applied(&self) -> bool {
        self.shuffle_applied
    }

    pub fn rows(&self) -> &[VariantResult] {
        &self.rows
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn completeness_mask(&self) -> Option<&CompletenessMask> {
        self.completeness_mask.as_ref()
    }

    pub fn abort(&self) -> Option<&AbortNotice> {
        self.abort.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for HuntResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}/{} variants computed ({:?})",
            self.hypothesis_id,
            self.status,
            self.variants_computed,
            self.total_variants,
            self.sort_order,
        )?;
        if let Some(abort) = &self.abort {
            write!(f, " {}", abort.notice)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Formatter
// ---------------------------------------------------------------------------

/// Caller-requested output transformations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Post-hoc shuffle with this seed. `None` keeps grid order.
    pub shuffle_seed: Option<u64>,
}

pub struct OutputFormatter;

impl OutputFormatter {
    /// Build the result document. Pure given the record and options:
    /// formatting the same record twice yields identical documents.
    pub fn format(record: &RunRecord, options: &FormatOptions) -> HuntResult {
        let mut rows = record.rows.clone();
        rows.sort_by_key(|r| r.index);

        let status = match record.state {
            RunState::Aborted => HuntStatus::Aborted,
            _ => HuntStatus::Complete,
        };
        let variants_computed = rows.len();

        let (completeness_mask, abort) = match status {
            HuntStatus::Complete => (None, None),
            HuntStatus::Aborted => {
                let mut cells = vec![false; record.total_variants];
                for row in &rows {
                    if let Some(cell) = cells.get_mut(row.index) {
                        *cell = true;
                    }
                }
                let reason = record
                    .abort
                    .clone()
                    .unwrap_or(AbortReason::RegimeChange);
                let notice = abort_notice(&reason, variants_computed, record.total_variants);
                (
                    Some(CompletenessMask::from_cells(cells)),
                    Some(AbortNotice { reason, notice }),
                )
            }
        };

        let (sort_order, shuffle_applied) = match options.shuffle_seed {
            Some(seed) => {
                rows.shuffle(&mut StdRng::seed_from_u64(seed));
                warn!(
                    hypothesis_id = %record.hypothesis_id,
                    seed,
                    "Post-hoc shuffle applied; rows are not in grid order"
                );
                (SortOrder::Shuffled, true)
            }
            None => (SortOrder::GridOrder, false),
        };

        info!(
            hypothesis_id = %record.hypothesis_id,
            status = %status,
            computed = variants_computed,
            total = record.total_variants,
            "Hunt result assembled"
        );

        HuntResult {
            hypothesis_id: record.hypothesis_id.clone(),
            question: record.question.clone(),
            status,
            total_variants: record.total_variants,
            variants_computed,
            variants_skipped: 0,
            sort_order,
            shuffle_applied,
            shuffle_seed: options.shuffle_seed,
            rows,
            provenance: Provenance {
                input_hash: record.input_hash.clone(),
                evaluator_version: record.evaluator_version.clone(),
                dataset_hash: record.dataset_hash.clone(),
            },
            completeness_mask,
            abort,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

fn abort_notice(reason: &AbortReason, computed: usize, total: usize) -> String {
    format!(
        "ABORTED: INCOMPLETE RESULT. Only {computed} of {total} variants were computed before the run was stopped ({reason}). \
         The remaining {} variants were NOT computed and nothing is known about them. \
         This result is not equivalent to a COMPLETE result.",
        total - computed.min(total)
    )
}

/// Human-readable grid-index ranges where `cells[i] == want`,
/// e.g. "grid indices 0-3 (4 variants)" or "none".
fn describe_region(cells: &[bool], want: bool) -> String {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (i, cell) in cells.iter().enumerate() {
        if *cell != want {
            continue;
        }
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == i => *end = i,
            _ => ranges.push((i, i)),
        }
    }
    if ranges.is_empty() {
        return "none".to_string();
    }
    let count: usize = ranges.iter().map(|(s, e)| e - s + 1).sum();
    let parts: Vec<String> = ranges
        .iter()
        .map(|(s, e)| if s == e { s.to_string() } else { format!("{s}-{e}") })
        .collect();
    format!("grid indices {} ({count} variants)", parts.join(", "))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
