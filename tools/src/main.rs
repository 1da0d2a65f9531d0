//! insight-runner: headless pipeline runner.
//!
//! Usage:
//!   insight-runner --input transactions.json --db insight.db
//!   insight-runner --input transactions.jsonl --as-of 2024-06-30 --query summary
//!   insight-runner --input transactions.json --seed 7 --query segments

use anyhow::{Context, Result};
use chrono::NaiveDate;
use retail_insight_core::{
    transaction::RawTransaction, ArtifactStore, PipelineConfig, PipelineOrchestrator, PipelineRun,
};
use serde::Serialize;
use std::env;
use std::path::Path;

/// Persistence failures are retried this many times before giving up.
const PERSIST_RETRIES: u32 = 2;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = flag(&args, "--config").unwrap_or("data/pipeline.json");
    let input = flag(&args, "--input").context("--input <path> is required")?;
    let db = flag(&args, "--db").unwrap_or(":memory:");
    let query = flag(&args, "--query");
    let as_of = flag(&args, "--as-of")
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("--as-of must be YYYY-MM-DD")?;

    let mut config = if Path::new(config_path).exists() {
        PipelineConfig::load(config_path)?
    } else {
        log::warn!("config {config_path} not found, using defaults");
        PipelineConfig::default()
    };
    config.seed = parse_arg(&args, "--seed", config.seed);

    let raw = read_transactions(input)?;

    if query.is_none() {
        println!("Retail Insight — insight-runner");
        println!("  input:     {input} ({} rows)", raw.len());
        println!("  db:        {db}");
        println!("  seed:      {}", config.seed);
        println!();
    }

    let store = ArtifactStore::open(db)?;
    let orchestrator = PipelineOrchestrator::new(config, store)?;
    let mut run = orchestrator.run(&raw, as_of)?;

    let mut retries = 0;
    while run.can_retry_persisting() && retries < PERSIST_RETRIES {
        retries += 1;
        log::warn!("run={} persistence failed, retry {retries}/{PERSIST_RETRIES}", run.run_id);
        orchestrator.retry_persisting(&mut run)?;
    }

    match query {
        None => print_summary(&run),
        Some(q) => {
            let queries = orchestrator.queries();
            match q {
                "summary" => print_json(&queries.revenue_summary(None)?)?,
                "forecasts" => print_json(&queries.forecasts(None)?)?,
                "segments" => print_json(&queries.segment_summary()?)?,
                "manifest" => print_json(&queries.run_manifest(&run.run_id)?)?,
                other => anyhow::bail!("unknown --query '{other}' (summary|forecasts|segments|manifest)"),
            }
        }
    }
    Ok(())
}

/// JSON array, or one JSON object per line.
fn read_transactions(path: &str) -> Result<Vec<RawTransaction>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).with_context(|| format!("Cannot parse {path}"));
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{path}:{}: bad record", i + 1))
        })
        .collect()
}

fn print_summary(run: &PipelineRun) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:     {}", run.run_id);
    println!("  state:      {}", run.state.as_str());
    if let Some(as_of) = run.as_of {
        println!("  as_of:      {as_of}");
    }
    println!("  input rows: {}", run.input_row_count);
    println!("  rejected:   {}", run.rejected_row_count);
    for (rule, count) in &run.rejections_by_rule {
        println!("    {rule:<24} {count}");
    }
    if let Some(failure) = &run.failure {
        println!("  failure:    {:?} in {}: {}", failure.kind, failure.stage.as_str(), failure.message);
    }

    println!();
    println!("=== ARTIFACTS ===");
    for artifact in &run.artifact_references {
        let tag = if artifact.partial { " (partial)" } else { "" };
        println!("  {:<18} {:>6} rows{tag}", artifact.table.table_name(), artifact.row_count);
    }

    if !run.warnings.is_empty() {
        println!();
        println!("=== WARNINGS ===");
        for w in &run.warnings {
            println!("  [{}] {:?}: {}", w.stage.as_str(), w.kind, w.message);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
