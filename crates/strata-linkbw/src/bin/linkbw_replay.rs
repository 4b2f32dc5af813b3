//! # Link Bandwidth Replay
//!
//! Runs a scripted scenario through the estimator and prints every
//! published update as one JSON object per line.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory statistics
//! linkbw-replay --scenario scenarios/lte_to_hspa.toml
//!
//! # Statistics persisted across runs, final state dumped to stderr
//! linkbw-replay --scenario scenarios/lte_to_hspa.toml --stats stats.json --dump
//! ```

use std::io::Write;

use strata_linkbw::scenario::{Scenario, ScenarioRunner};
use strata_linkbw::stats::{JsonFileStatsStore, MemoryStatsStore, NetworkStatsStore};

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    tracing::info!(
        scenario = %args.scenario,
        stats = ?args.stats,
        "linkbw-replay starting"
    );

    // ── Scenario ────────────────────────────────────────────────
    let input = std::fs::read_to_string(&args.scenario)
        .map_err(|e| anyhow::anyhow!("Failed to read scenario '{}': {}", args.scenario, e))?;
    let scenario = Scenario::from_toml_str(&input)
        .map_err(|e| anyhow::anyhow!("Failed to parse scenario '{}': {}", args.scenario, e))?;

    let store: Box<dyn NetworkStatsStore> = match &args.stats {
        Some(path) => Box::new(
            JsonFileStatsStore::open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open stats '{}': {}", path, e))?,
        ),
        None => Box::new(MemoryStatsStore::new()),
    };

    // ── Replay ──────────────────────────────────────────────────
    let outcome = ScenarioRunner::new(scenario, store)?.run();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for update in &outcome.updates {
        serde_json::to_writer(&mut out, update)?;
        writeln!(out)?;
    }

    if args.dump {
        eprintln!("{}", outcome.dump);
    }

    tracing::info!(
        updates = outcome.updates.len(),
        tx_kbps = outcome.filtered_kbps.0,
        rx_kbps = outcome.filtered_kbps.1,
        "linkbw-replay finished"
    );
    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    scenario: String,
    stats: Option<String>,
    dump: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut scenario = None;
    let mut stats = None;
    let mut dump = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--scenario" | "-s" => {
                i += 1;
                scenario = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--scenario requires a value"))?
                        .clone(),
                );
            }
            "--stats" => {
                i += 1;
                stats = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--stats requires a value"))?
                        .clone(),
                );
            }
            "--dump" | "-d" => dump = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    if stats.is_none() {
        stats = std::env::var("LINKBW_STATS").ok().filter(|s| !s.is_empty());
    }

    let Some(scenario) = scenario else {
        anyhow::bail!("no scenario specified. Use --scenario.\nRun with --help for usage.");
    };

    Ok(Args {
        scenario,
        stats,
        dump,
    })
}

fn print_help() {
    eprintln!(
        r#"linkbw-replay — Replay a scripted scenario through the link bandwidth estimator

USAGE:
  linkbw-replay --scenario <PATH> [OPTIONS]

OPTIONS:
  --scenario, -s <path>   Scenario TOML file (required)
  --stats <path>          JSON statistics file, created if missing
                           (env: LINKBW_STATS; default: in-memory)
  --dump, -d              Print estimator state to stderr when done
  --help, -h              Show this help

OUTPUT:
  One JSON object per published update on stdout:
  {{"at_ms":26000,"tx_kbps":9956,"rx_kbps":24618}}

ENVIRONMENT:
  RUST_LOG                Log filter (default: info)"#
    );
}
