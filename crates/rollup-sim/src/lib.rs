//! Deterministic simulation of rollup cache maintenance.
//!
//! A seeded workload mutates a small host database through the engine,
//! draining the deferred log every few steps, and an oracle then compares
//! every stored summary with its full recompute.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod workload;

use anyhow::{Result, bail};
use rollup_core::log::{DrainOptions, pending_count};
use serde::{Deserialize, Serialize};

use crate::oracle::{CacheOracle, OracleResult};
use crate::rng::DeterministicRng;
use crate::workload::{Action, Host, Shape};

/// Parameters of one simulated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Host mutations to perform.
    pub steps: u64,
    pub shape: Shape,
    /// Drain the deferred log after this many steps; 0 drains only at the end.
    pub drain_every: u64,
    /// Entries per drain cycle; small values leave work behind between cycles.
    pub drain_batch: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 200,
            shape: Shape {
                customers: 3,
                orders: 6,
                categories: 5,
            },
            drain_every: 16,
            drain_batch: 8,
        }
    }
}

/// One recorded step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    Mutation {
        action: Action,
        operations: usize,
        statements: usize,
        escalated: usize,
        enqueued: usize,
    },
    Drain {
        applied: usize,
        canceled: usize,
        failed: usize,
        deferred: usize,
    },
}

/// Counters summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub operations: usize,
    pub statements: usize,
    pub escalated: usize,
    pub enqueued: usize,
    pub applied: usize,
    pub canceled: usize,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub totals: Totals,
    pub oracle: OracleResult,
    /// The run superseded a deferred entry or escalated a collision.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    host: Host,
    trace: Vec<TraceEvent>,
    totals: Totals,
}

impl Simulator {
    /// Prepare a fresh host for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or the host
    /// cannot be created.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let Shape {
            customers,
            orders,
            categories,
        } = config.shape;
        if customers < 1 || orders < 1 || categories < 1 {
            bail!("shape needs at least one customer, order and category: {:?}", config.shape);
        }
        if config.drain_batch == 0 {
            bail!("drain_batch must be > 0");
        }
        Ok(Self {
            config,
            rng: DeterministicRng::new(config.seed),
            host: Host::open(config.shape)?,
            trace: Vec::new(),
            totals: Totals::default(),
        })
    }

    #[must_use]
    pub const fn host(&self) -> &Host {
        &self.host
    }

    /// Run the workload, settle the log and consult the oracle.
    ///
    /// # Errors
    ///
    /// Returns an error if a mutation fails or the store cannot be queried.
    /// Invariant violations are not errors; they are in the result.
    pub fn run(&mut self) -> Result<SimulationResult> {
        for step in 0..self.config.steps {
            let action = self.host.next_action(&mut self.rng);
            let report = self.host.apply(&action, step)?;
            self.totals.operations += report.operations;
            self.totals.statements += report.statements;
            self.totals.escalated += report.escalated;
            self.totals.enqueued += report.enqueued;
            self.trace.push(TraceEvent {
                step,
                kind: TraceEventKind::Mutation {
                    action,
                    operations: report.operations,
                    statements: report.statements,
                    escalated: report.escalated,
                    enqueued: report.enqueued,
                },
            });

            if self.config.drain_every > 0 && (step + 1) % self.config.drain_every == 0 {
                self.drain(step)?;
            }
        }
        self.settle()?;

        let oracle = CacheOracle::check_all(self.host.conn(), self.host.registry())?;
        if !oracle.passed {
            tracing::warn!(
                seed = self.config.seed,
                violations = oracle.violations.len(),
                "simulation found invariant violations"
            );
        }
        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace.clone(),
            totals: self.totals,
            interesting_state_reached: self.totals.canceled > 0 || self.totals.escalated > 0,
            oracle,
        })
    }

    fn drain(&mut self, step: u64) -> Result<usize> {
        let options = DrainOptions {
            batch_size: self.config.drain_batch,
            deadline: None,
        };
        let report = self.host.engine().drain_pending(&options)?;
        self.totals.applied += report.applied;
        self.totals.canceled += report.canceled;
        self.trace.push(TraceEvent {
            step,
            kind: TraceEventKind::Drain {
                applied: report.applied,
                canceled: report.canceled,
                failed: report.failed,
                deferred: report.deferred,
            },
        });
        Ok(report.handled())
    }

    /// Drain until the log is empty or a cycle makes no progress.
    fn settle(&mut self) -> Result<()> {
        while pending_count(self.host.conn())? > 0 {
            if self.drain(self.config.steps)? == 0 {
                break;
            }
        }
        Ok(())
    }
}
