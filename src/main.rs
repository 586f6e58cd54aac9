//! fleet_dispatch - fault-tolerant master/worker task dispatch
//!
//! Entry point for the CLI application.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_dispatch::cluster::{self, ClusterOutcome, ClusterPlan};
use fleet_dispatch::config::{Cli, Command, DispatchConfig, RunArgs};
use fleet_dispatch::logging;
use fleet_dispatch::stats::{FileStatsSink, LogStatsSink, StatsSink};
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let result = match cli.command {
        Some(Command::Run(args)) => run(args),
        Some(Command::Demo) | None => run_demo(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let config = DispatchConfig::from_args(args).context("Invalid configuration")?;
    let manifest = config
        .load_manifest()
        .context("Cannot obtain the initial task list")?;
    if let Some(dir) = config.output_dir.as_ref() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create output directory {}", dir.display()))?;
    }

    let sink: Box<dyn StatsSink> = match config.stats_path.as_ref() {
        Some(path) => Box::new(FileStatsSink::new(path, config.stats_format)),
        None => Box::new(LogStatsSink),
    };
    let outcome = cluster::run_cluster(
        manifest,
        &ClusterPlan::from_config(&config),
        cluster::build_executor(&config.executor),
        sink.as_ref(),
    )
    .context("Dispatch failed")?;

    print_summary("RUN SUMMARY", &outcome);
    if outcome.dispatch.stats.unexecuted > 0 {
        info!(
            unexecuted = outcome.dispatch.stats.unexecuted,
            "every worker retired before the queue drained"
        );
    }
    Ok(())
}

fn run_demo() -> Result<()> {
    info!("[DEMO] start");
    let outcome = cluster::run_cluster(
        cluster::demo_manifest(),
        &ClusterPlan::demo(),
        cluster::demo_executor(),
        &LogStatsSink,
    )
    .context("Demo failed")?;
    print_summary("DEMO SUMMARY", &outcome);
    Ok(())
}

fn print_summary(title: &str, outcome: &ClusterOutcome) {
    let stats = &outcome.dispatch.stats;
    let per_worker: Vec<usize> = outcome
        .dispatch
        .workers
        .iter()
        .map(|record| {
            outcome
                .report(record.id)
                .map_or(0, |report| report.executed.len())
        })
        .collect();
    println!("{title}");
    println!("workers={} tasks_total={}", outcome.dispatch.workers.len(), stats.total_tasks);
    println!("tasks_per_worker_done={per_worker:?}");
    println!("dispatched={}", stats.dispatched);
    println!("requeued={}", stats.requeued);
    println!("unexecuted={}", stats.unexecuted);
    println!("dead_workers={:?}", outcome.dispatch.dead_workers());
    println!("elapsed_ms={:.2}", stats.elapsed_ms);
    println!("throughput_tasks_per_s={:.2}", stats.throughput_tasks_per_s);
}
