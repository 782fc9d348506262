//! Shared types for the HUNT engine.
//!
//! These types form the data model used across all modules: the
//! validated `Hypothesis` value object, its grid, the concrete `Variant`
//! drawn from it, and the domain error enum. Grid, budget, queue, engine
//! and output modules depend on them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Absolute upper bound on declared grid dimensions. Config may lower it,
/// never raise it.
pub const HARD_MAX_DIMENSIONS: usize = 3;

/// Keys that would smuggle ordering or preference into a hypothesis.
const FORBIDDEN_KEYS: &[&str] = &["priority", "rank", "score"];

// ---------------------------------------------------------------------------
// Parameter values
// ---------------------------------------------------------------------------

/// One value a grid dimension (or fixed parameter) can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(_) | ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// Named parameters that stay constant across every variant.
pub type ParamSet = BTreeMap<String, ParamValue>;

/// Metric name → value, as produced by an evaluator for one variant.
pub type Metrics = BTreeMap<String, f64>;

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// One declared grid axis: an ordered list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl Dimension {
    pub fn new(name: &str, values: Vec<ParamValue>) -> Self {
        Self {
            name: name.to_string(),
            values,
        }
    }

    pub fn cardinality(&self) -> usize {
        self.values.len()
    }
}

/// Caps applied to a grid before it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLimits {
    pub max_dimensions: usize,
    pub max_values_per_dimension: usize,
}

impl Default for GridLimits {
    fn default() -> Self {
        Self {
            max_dimensions: HARD_MAX_DIMENSIONS,
            max_values_per_dimension: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Constraints, budget, attribution
// ---------------------------------------------------------------------------

/// Historical window the evaluator should restrict itself to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Evaluation constraints passed through to the evaluator untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constraints {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub filters: ParamSet,
}

/// Budget declared by the hypothesis author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HuntBudget {
    /// Hard ceiling on the number of variants this hypothesis may compute.
    pub max_variants: u64,
    /// Explicit permission to exceed the system-wide variant ceiling.
    #[serde(default)]
    pub override_system_ceiling: bool,
}

/// Who authored or approved something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attribution {
    Human { name: String },
    System { component: String },
}

impl Attribution {
    pub fn human(name: &str) -> Self {
        Attribution::Human {
            name: name.to_string(),
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Attribution::Human { .. })
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Human { name } => write!(f, "human:{name}"),
            Attribution::System { component } => write!(f, "system:{component}"),
        }
    }
}

/// A recorded human approval. Set at most once per hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Approval {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hypothesis
// ---------------------------------------------------------------------------

/// Raw, unvalidated hypothesis as it arrives from the approval workflow.
///
/// Turned into a [`Hypothesis`] with [`Hypothesis::new`]; nothing downstream
/// ever sees a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HypothesisDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    pub grid: Vec<Dimension>,
    #[serde(default)]
    pub fixed_params: ParamSet,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub constraints: Constraints,
    pub budget: HuntBudget,
    pub author: Attribution,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub approved_by: Option<Attribution>,
    /// Set when this draft re-runs an earlier, already consumed hypothesis.
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A human-authored request to exhaustively evaluate a parameter grid.
///
/// Only constructible through validation, so every instance satisfies the
/// dimension/cardinality caps, carries at least one metric and has a human
/// author. Fields are read-only after construction; the sole mutation is a
/// one-time [`approve`](Hypothesis::approve).
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    id: String,
    question: String,
    grid: Vec<Dimension>,
    fixed_params: ParamSet,
    metrics: Vec<String>,
    constraints: Constraints,
    budget: HuntBudget,
    author: String,
    approval: Option<Approval>,
    parent_id: Option<String>,
}

/// The subset of a hypothesis that determines what gets computed.
/// Serialized canonically for the provenance input hash.
#[derive(Serialize)]
struct HypothesisContent<'a> {
    id: &'a str,
    question: &'a str,
    grid: &'a [Dimension],
    fixed_params: &'a ParamSet,
    metrics: &'a [String],
    constraints: &'a Constraints,
    budget: &'a HuntBudget,
}

impl Hypothesis {
    /// Validate a draft against the grid caps.
    pub fn new(draft: HypothesisDraft, limits: &GridLimits) -> Result<Self, HuntError> {
        let id = match draft.id {
            Some(id) if id.trim().is_empty() => {
                return Err(HuntError::validation("id", "must not be blank when supplied"));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        if draft.question.trim().is_empty() {
            return Err(HuntError::validation("question", "must not be empty"));
        }

        validate_grid(&draft.grid, limits)?;
        validate_metrics(&draft.metrics)?;

        for name in draft.fixed_params.keys() {
            if draft.grid.iter().any(|d| &d.name == name) {
                return Err(HuntError::validation(
                    format!("fixed_params.{name}"),
                    "fixed parameter shadows a grid dimension",
                ));
            }
        }

        if let Some(range) = &draft.constraints.time_range {
            if range.start >= range.end {
                return Err(HuntError::validation(
                    "constraints.time_range",
                    format!("start {} is not before end {}", range.start, range.end),
                ));
            }
        }

        if draft.budget.max_variants == 0 {
            return Err(HuntError::validation(
                "budget.max_variants",
                "must be greater than zero",
            ));
        }

        let author = match draft.author {
            Attribution::Human { name } if !name.trim().is_empty() => name,
            Attribution::Human { .. } => {
                return Err(HuntError::validation("author", "human author name is blank"));
            }
            Attribution::System { component } => {
                return Err(HuntError::validation(
                    "author",
                    format!("hypotheses must be human-authored, got system component '{component}'"),
                ));
            }
        };

        let approval = match (draft.approved, draft.approved_by) {
            (false, None) => None,
            (false, Some(_)) => {
                return Err(HuntError::validation(
                    "approved_by",
                    "attribution present but approved is false",
                ));
            }
            (true, None) => {
                return Err(HuntError::validation(
                    "approved_by",
                    "approval requires a human attribution",
                ));
            }
            (true, Some(by)) => Some(approval_from(by)?),
        };

        Ok(Self {
            id,
            question: draft.question,
            grid: draft.grid,
            fixed_params: draft.fixed_params,
            metrics: draft.metrics,
            constraints: draft.constraints,
            budget: draft.budget,
            author,
            approval,
            parent_id: draft.parent_id,
        })
    }

    /// Parse and validate a raw JSON hypothesis document.
    ///
    /// Ranking keys (`priority`, `rank`, `score`) are rejected by name
    /// before schema parsing so the error points at the offending field.
    pub fn from_json(text: &str, limits: &GridLimits) -> Result<Self, HuntError> {
        let raw: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| HuntError::validation("document", e.to_string()))?;

        if let Some(obj) = raw.as_object() {
            for key in FORBIDDEN_KEYS {
                if obj.contains_key(*key) {
                    return Err(HuntError::validation(
                        *key,
                        "hypotheses carry no ordering field; all queued work is equal",
                    ));
                }
            }
        }

        let draft: HypothesisDraft = serde_json::from_value(raw)
            .map_err(|e| HuntError::validation("document", e.to_string()))?;
        Self::new(draft, limits)
    }

    /// Record the one and only human approval.
    pub fn approve(&mut self, approver: Attribution) -> Result<(), HuntError> {
        if let Some(existing) = &self.approval {
            return Err(HuntError::validation(
                "approved_by",
                format!("already approved by {}", existing.approved_by),
            ));
        }
        self.approval = Some(approval_from(approver)?);
        Ok(())
    }

    /// Draft for a fresh run of the same question. The new draft has no id,
    /// no approval, and points back at this hypothesis.
    pub fn rerun(&self) -> HypothesisDraft {
        HypothesisDraft {
            id: None,
            question: self.question.clone(),
            grid: self.grid.clone(),
            fixed_params: self.fixed_params.clone(),
            metrics: self.metrics.clone(),
            constraints: self.constraints.clone(),
            budget: self.budget.clone(),
            author: Attribution::human(&self.author),
            approved: false,
            approved_by: None,
            parent_id: Some(self.id.clone()),
        }
    }

    /// Re-check the grid caps, e.g. against a queue configured with
    /// tighter limits than the ones used at construction.
    pub fn check_limits(&self, limits: &GridLimits) -> Result<(), HuntError> {
        validate_grid(&self.grid, limits)
    }

    /// Hex SHA-256 over the canonical JSON of everything that determines
    /// the computation.
    pub fn input_hash(&self) -> String {
        let content = HypothesisContent {
            id: &self.id,
            question: &self.question,
            grid: &self.grid,
            fixed_params: &self.fixed_params,
            metrics: &self.metrics,
            constraints: &self.constraints,
            budget: &self.budget,
        };
        // Serializing plain data with string keys cannot fail.
        let canonical = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn grid(&self) -> &[Dimension] {
        &self.grid
    }

    pub fn fixed_params(&self) -> &ParamSet {
        &self.fixed_params
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn budget(&self) -> &HuntBudget {
        &self.budget
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn approval(&self) -> Option<&Approval> {
        self.approval.as_ref()
    }

    pub fn is_approved(&self) -> bool {
        self.approval.is_some()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
}

impl fmt::Display for Hypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .grid
            .iter()
            .map(|d| format!("{}[{}]", d.name, d.cardinality()))
            .collect();
        write!(
            f,
            "[{}] {} (grid: {} | metrics: {} | max_variants: {})",
            self.id,
            self.question,
            dims.join(" x "),
            self.metrics.join(","),
            self.budget.max_variants,
        )
    }
}

fn approval_from(by: Attribution) -> Result<Approval, HuntError> {
    match by {
        Attribution::Human { name } if !name.trim().is_empty() => Ok(Approval {
            approved_by: name,
            approved_at: Utc::now(),
        }),
        Attribution::Human { .. } => Err(HuntError::validation(
            "approved_by",
            "human approver name is blank",
        )),
        Attribution::System { component } => Err(HuntError::validation(
            "approved_by",
            format!("approval cannot originate from system component '{component}'"),
        )),
    }
}

fn validate_grid(grid: &[Dimension], limits: &GridLimits) -> Result<(), HuntError> {
    let max_dims = limits.max_dimensions.min(HARD_MAX_DIMENSIONS);
    if grid.is_empty() {
        return Err(HuntError::validation("grid", "at least one dimension is required"));
    }
    if grid.len() > max_dims {
        return Err(HuntError::validation(
            format!("grid.{}", grid[max_dims].name),
            format!("{} dimensions declared, at most {max_dims} allowed", grid.len()),
        ));
    }

    let mut seen = BTreeSet::new();
    for dim in grid {
        if dim.name.trim().is_empty() {
            return Err(HuntError::validation("grid", "dimension name must not be blank"));
        }
        if !seen.insert(dim.name.as_str()) {
            return Err(HuntError::validation(
                format!("grid.{}", dim.name),
                "dimension declared twice",
            ));
        }
        if dim.values.is_empty() {
            return Err(HuntError::validation(
                format!("grid.{}", dim.name),
                "dimension has no values",
            ));
        }
        if dim.values.len() > limits.max_values_per_dimension {
            return Err(HuntError::validation(
                format!("grid.{}", dim.name),
                format!(
                    "{} values declared, at most {} allowed",
                    dim.values.len(),
                    limits.max_values_per_dimension
                ),
            ));
        }
        for (i, value) in dim.values.iter().enumerate() {
            if dim.values[..i].contains(value) {
                return Err(HuntError::validation(
                    format!("grid.{}", dim.name),
                    format!("duplicate value {value}"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_metrics(metrics: &[String]) -> Result<(), HuntError> {
    if metrics.is_empty() {
        return Err(HuntError::validation("metrics", "at least one metric is required"));
    }
    let mut seen = BTreeSet::new();
    for m in metrics {
        if m.trim().is_empty() {
            return Err(HuntError::validation("metrics", "metric name must not be blank"));
        }
        if !seen.insert(m.as_str()) {
            return Err(HuntError::validation("metrics", format!("metric '{m}' listed twice")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// A single (dimension, value) assignment inside a variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamBinding {
    pub dimension: String,
    pub value: ParamValue,
}

/// One concrete parameter combination drawn from the grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    /// Position in grid order.
    pub index: usize,
    pub variant_id: String,
    pub params: Vec<ParamBinding>,
}

impl Variant {
    /// Build a variant, deriving its id from the hypothesis id and tuple.
    pub fn new(hypothesis_id: &str, index: usize, params: Vec<ParamBinding>) -> Self {
        let variant_id = derive_variant_id(hypothesis_id, &params);
        Self {
            index,
            variant_id,
            params,
        }
    }

    /// Value bound to a dimension in this variant.
    pub fn value(&self, dimension: &str) -> Option<&ParamValue> {
        self.params
            .iter()
            .find(|b| b.dimension == dimension)
            .map(|b| &b.value)
    }

    /// Parameters keyed by dimension name.
    pub fn params_map(&self) -> ParamSet {
        self.params
            .iter()
            .map(|b| (b.dimension.clone(), b.value.clone()))
            .collect()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|b| format!("{}={}", b.dimension, b.value))
            .collect();
        write!(f, "#{} ({})", self.index, parts.join(", "))
    }
}

fn derive_variant_id(hypothesis_id: &str, params: &[ParamBinding]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hypothesis_id.as_bytes());
    hasher.update([0x00]);
    for binding in params {
        hasher.update(binding.dimension.as_bytes());
        hasher.update([0x1f]);
        // Tag the value type so Int(1) and Float(1.0) never collide.
        let encoded = serde_json::to_string(&binding.value).unwrap_or_default();
        let tag: &[u8] = match binding.value {
            ParamValue::Bool(_) => b"b",
            ParamValue::Int(_) => b"i",
            ParamValue::Float(_) => b"f",
            ParamValue::Text(_) => b"s",
        };
        hasher.update(tag);
        hasher.update(encoded.as_bytes());
        hasher.update([0x1e]);
    }
    let digest = hasher.finalize();
    format!("var-{}", hex::encode(&digest[..16]))
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors that are returned synchronously and never downgraded.
///
/// Mid-run aborts are not errors; see `engine::AbortReason`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HuntError {
    #[error("Validation error ({field}): {message}")]
    Validation { field: String, message: String },

    #[error("Approval error: {0}")]
    Approval(String),

    #[error("Budget rejected: {reason} (suggestion: {suggestion})")]
    BudgetRejected { reason: String, suggestion: String },

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl HuntError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        HuntError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

impl HypothesisDraft {
    /// Helper to build a draft with sensible defaults for tests and demos:
    /// `delay:[0,15,30] x mult:[1.0,1.5]`, one metric, human author,
    /// not yet approved.
    pub fn sample() -> Self {
        HypothesisDraft {
            id: Some("hyp-sample".to_string()),
            question: "Does entry delay interact with the size multiplier?".to_string(),
            grid: vec![
                Dimension::new("delay", vec![0i64.into(), 15i64.into(), 30i64.into()]),
                Dimension::new("mult", vec![1.0f64.into(), 1.5f64.into()]),
            ],
            fixed_params: ParamSet::new(),
            metrics: vec!["metric".to_string()],
            constraints: Constraints::default(),
            budget: HuntBudget {
                max_variants: 100,
                override_system_ceiling: false,
            },
            author: Attribution::human("analyst"),
            approved: false,
            approved_by: None,
            parent_id: None,
        }
    }

    /// The sample draft, already approved by a human.
    pub fn sample_approved() -> Self {
        HypothesisDraft {
            approved: true,
            approved_by: Some(Attribution::human("reviewer")),
            ..Self::sample()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
