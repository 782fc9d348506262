//! Grid expansion.
//!
//! Turns a hypothesis' declared dimensions into the ordered sequence of
//! concrete variants. Expansion is a pure function of the hypothesis id and
//! the grid: left-to-right cartesian product over declared dimension order,
//! first dimension varying slowest, last dimension fastest.

use tracing::debug;

use crate::types::{Dimension, Hypothesis, HuntError, ParamBinding, Variant, HARD_MAX_DIMENSIONS};

/// Ordered variant sequence plus its length.
#[derive(Debug, Clone, PartialEq)]
pub struct GridExpansion {
    pub variants: Vec<Variant>,
    pub total: usize,
}

pub struct GridExpander;

impl GridExpander {
    /// Expand a validated hypothesis into grid order.
    pub fn expand(hypothesis: &Hypothesis) -> Result<GridExpansion, HuntError> {
        Self::expand_dimensions(hypothesis.id(), hypothesis.grid())
    }

    /// Expand raw dimensions. Rejects more than three dimensions or any
    /// dimension with zero values, naming the offending dimension.
    pub fn expand_dimensions(
        hypothesis_id: &str,
        dimensions: &[Dimension],
    ) -> Result<GridExpansion, HuntError> {
        if dimensions.len() > HARD_MAX_DIMENSIONS {
            return Err(HuntError::validation(
                format!("grid.{}", dimensions[HARD_MAX_DIMENSIONS].name),
                format!(
                    "{} dimensions declared, at most {HARD_MAX_DIMENSIONS} allowed",
                    dimensions.len()
                ),
            ));
        }
        if let Some(empty) = dimensions.iter().find(|d| d.values.is_empty()) {
            return Err(HuntError::validation(
                format!("grid.{}", empty.name),
                "dimension has no values",
            ));
        }

        let total = Self::count(dimensions) as usize;
        let variants: Vec<Variant> = (0..total)
            .map(|index| variant_at(hypothesis_id, dimensions, index))
            .collect();

        debug!(
            hypothesis_id,
            dimensions = dimensions.len(),
            total,
            "Grid expanded"
        );

        Ok(GridExpansion { variants, total })
    }

    /// Product of per-dimension cardinalities (saturating). An empty grid
    /// counts as zero variants.
    pub fn count(dimensions: &[Dimension]) -> u64 {
        if dimensions.is_empty() {
            return 0;
        }
        dimensions
            .iter()
            .fold(1u64, |acc, d| acc.saturating_mul(d.cardinality() as u64))
    }
}

/// Decode a grid-order index into one value per dimension (mixed radix,
/// last dimension least significant).
fn variant_at(hypothesis_id: &str, dimensions: &[Dimension], index: usize) -> Variant {
    let mut remainder = index;
    let mut picks = vec![0usize; dimensions.len()];
    for (slot, dim) in dimensions.iter().enumerate().rev() {
        let radix = dim.cardinality();
        picks[slot] = remainder % radix;
        remainder /= radix;
    }

    let params = dimensions
        .iter()
        .zip(picks)
        .map(|(dim, pick)| ParamBinding {
            dimension: dim.name.clone(),
            value: dim.values[pick].clone(),
        })
        .collect();

    Variant::new(hypothesis_id, index, params)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
