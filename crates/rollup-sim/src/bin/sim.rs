#![forbid(unsafe_code)]

use std::env;

use anyhow::{Result, bail};
use clap::Parser;
use rollup_sim::campaign::{CampaignConfig, format_violation, run_campaign};
use rollup_sim::{SimulationConfig, Simulator};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Drive random workloads through the rollup engine and check every
/// summary against a full recompute.
#[derive(Parser, Debug)]
#[command(name = "rollup-sim", version)]
struct Cli {
    /// Seed of a single run, or the first seed of a campaign.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Host mutations per run.
    #[arg(long, default_value_t = 200)]
    steps: u64,

    /// Run a campaign over this many consecutive seeds.
    #[arg(long)]
    seeds: Option<u64>,

    /// Drain the deferred log every N steps (0: only at the end).
    #[arg(long, default_value_t = 16)]
    drain_every: u64,

    /// Print the campaign report or run trace as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(count) = cli.seeds {
        let config = CampaignConfig {
            seed_range: cli.seed..cli.seed.saturating_add(count),
            steps: cli.steps,
            drain_every: cli.drain_every,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "campaign complete: seeds={} passed={} interesting={}",
                report.seeds_run, report.seeds_passed, report.interesting_states_reached
            );
            for failure in &report.failures {
                for violation in &failure.violations {
                    println!("  seed {}: {violation}", failure.seed);
                }
            }
        }
        if let Some(seed) = report.first_failure {
            bail!("campaign failed; replay with --seed {seed}");
        }
        return Ok(());
    }

    let config = SimulationConfig {
        seed: cli.seed,
        steps: cli.steps,
        drain_every: cli.drain_every,
        ..SimulationConfig::default()
    };
    let result = Simulator::new(config)?.run()?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result.trace)?);
    }
    println!(
        "simulation complete: seed={} steps={} operations={} enqueued={} canceled={} passed={}",
        result.seed,
        cli.steps,
        result.totals.operations,
        result.totals.enqueued,
        result.totals.canceled,
        result.oracle.passed
    );
    if !result.oracle.passed {
        for violation in &result.oracle.violations {
            println!("  {}", format_violation(violation));
        }
        bail!("seed {} violated {} invariants", result.seed, result.oracle.violations.len());
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ROLLUP_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "rollup=debug,info"
        } else {
            "rollup=info,warn"
        })
    });

    let format = env::var("ROLLUP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}
