//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to its defaults, so a partial file (or none at all,
//! via `HuntConfig::default()`) is valid. The numeric ceilings here are
//! operational defaults, not constants of the engine.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::{GridLimits, HARD_MAX_DIMENSIONS};

/// Longest run ceiling accepted (one week). Durations derived from config
/// are clamped to it so deadline arithmetic cannot overflow.
pub const MAX_RUN_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level engine configuration.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HuntConfig {
    pub grid: GridConfig,
    pub budget: BudgetConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// May be lowered below 3, never raised above it.
    pub max_dimensions: usize,
    pub max_values_per_dimension: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_dimensions: HARD_MAX_DIMENSIONS,
            max_values_per_dimension: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// System-wide variant ceiling; exceeding it needs an explicit override.
    pub system_max_variants: u64,
    /// Absolute wall-clock ceiling for one run.
    pub max_run_secs: u64,
    /// Ceiling for a single variant evaluation. Must be below `max_run_secs`.
    pub per_variant_timeout_secs: u64,
    /// Cost model used by the pre-execution estimate.
    pub estimated_secs_per_variant: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            system_max_variants: 10_000,
            max_run_secs: 1_800,
            per_variant_timeout_secs: 60,
            estimated_secs_per_variant: 1.0,
        }
    }
}

impl BudgetConfig {
    pub fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    pub fn per_variant_timeout(&self) -> Duration {
        Duration::from_secs(self.per_variant_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Enqueue attempts accepted per rolling hour.
    pub max_enqueues_per_hour: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_enqueues_per_hour: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bounded worker pool size. 1 runs variants strictly sequentially.
    pub concurrency: usize,
    /// How often the regime probe is polled while waiting on results.
    pub regime_poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            regime_poll_interval_ms: 250,
        }
    }
}

impl ExecutorConfig {
    pub fn regime_poll_interval(&self) -> Duration {
        Duration::from_millis(self.regime_poll_interval_ms)
    }
}

impl HuntConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: HuntConfig =
            toml::from_str(contents).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the ceilings meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.grid.max_dimensions == 0 || self.grid.max_dimensions > HARD_MAX_DIMENSIONS {
            bail!(
                "grid.max_dimensions must be between 1 and {HARD_MAX_DIMENSIONS}, got {}",
                self.grid.max_dimensions
            );
        }
        if self.grid.max_values_per_dimension == 0 {
            bail!("grid.max_values_per_dimension must be greater than zero");
        }
        if self.budget.system_max_variants == 0 {
            bail!("budget.system_max_variants must be greater than zero");
        }
        if self.budget.max_run_secs == 0 || self.budget.max_run_secs > MAX_RUN_SECS {
            bail!(
                "budget.max_run_secs must be between 1 and {MAX_RUN_SECS}, got {}",
                self.budget.max_run_secs
            );
        }
        if self.budget.per_variant_timeout_secs == 0
            || self.budget.per_variant_timeout_secs >= self.budget.max_run_secs
        {
            bail!(
                "budget.per_variant_timeout_secs ({}) must be positive and below max_run_secs ({})",
                self.budget.per_variant_timeout_secs,
                self.budget.max_run_secs
            );
        }
        if !(self.budget.estimated_secs_per_variant >= 0.0) {
            bail!("budget.estimated_secs_per_variant must be a non-negative number");
        }
        if self.queue.max_enqueues_per_hour == 0 {
            bail!("queue.max_enqueues_per_hour must be greater than zero");
        }
        if self.executor.concurrency == 0 {
            bail!("executor.concurrency must be greater than zero");
        }
        if self.executor.regime_poll_interval_ms == 0
            || self.executor.regime_poll_interval_ms / 1_000 >= self.budget.max_run_secs
        {
            bail!(
                "executor.regime_poll_interval_ms ({}) must be positive and below max_run_secs ({})",
                self.executor.regime_poll_interval_ms,
                self.budget.max_run_secs
            );
        }
        Ok(())
    }

    /// Grid caps derived from the `[grid]` section.
    pub fn grid_limits(&self) -> GridLimits {
        GridLimits {
            max_dimensions: self.grid.max_dimensions,
            max_values_per_dimension: self.grid.max_values_per_dimension,
        }
    }
}
