//! Campaign runner: many seeds, one verdict.
//!
//! Executes a seed range with shared workload parameters, collecting
//! pass/fail results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::oracle::InvariantViolation;
use crate::workload::Shape;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration: which seeds to run and the workload
/// parameters each seed shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    pub steps: u64,
    pub shape: Shape,
    pub drain_every: u64,
    pub drain_batch: usize,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let defaults = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            steps: defaults.steps,
            shape: defaults.shape,
            drain_every: defaults.drain_every,
            drain_batch: defaults.drain_batch,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            steps: self.steps,
            shape: self.shape,
            drain_every: self.drain_every,
            drain_batch: self.drain_batch,
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        if self.drain_batch == 0 {
            bail!("drain_batch must be > 0");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that canceled a deferred entry or escalated a collision.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        let result = replay_seed(seed, config)?;
        report.seeds_run += 1;
        if result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if result.oracle.passed {
            report.seeds_passed += 1;
        } else {
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: result.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    tracing::info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign complete"
    );
    Ok(report)
}

/// Replay a single seed with its full trace.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    config.validate()?;
    Simulator::new(config.sim_config_for_seed(seed))?.run()
}

/// Format an invariant violation into a human-readable string.
#[must_use]
pub fn format_violation(v: &InvariantViolation) -> String {
    match v {
        InvariantViolation::Drift {
            model,
            key,
            field,
            stored,
            expected,
        } => format!("Drift: {model}[{key}].{field} stored={stored} expected={expected}"),
        InvariantViolation::NegativeCount {
            model,
            key,
            field,
            value,
        } => format!("NegativeCount: {model}[{key}].{field} = {value}"),
        InvariantViolation::PendingEntries { count } => {
            format!("PendingEntries: {count} log entries left after the final drain")
        }
        InvariantViolation::FailedEntries { count } => {
            format!("FailedEntries: {count} deferred operations failed")
        }
    }
}
