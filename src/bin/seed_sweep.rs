use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use evotrader::{Dataset, RunSummary, SimulationConfig, SimulationEngine};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*};

/// Runs the same simulation for several seeds and records how each one ends.
#[derive(Parser)]
#[command(name = "seed-sweep")]
struct Args {
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    start_date: NaiveDate,
    #[arg(long)]
    end_date: NaiveDate,
    /// Each seed gets its own `seed_<n>` directory under here.
    #[arg(long)]
    out_dir: PathBuf,
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4,5,6")]
    seeds: Vec<u64>,
    #[arg(long, default_value_t = 20)]
    generations: usize,
    #[arg(long, default_value_t = 100)]
    population: usize,
    #[arg(long, default_value_t = 0.2)]
    survival_rate: f64,
    #[arg(long, default_value_t = false)]
    elitism: bool,
    /// Seeds evaluated at the same time.
    #[arg(long, default_value_t = 3)]
    parallel_runs: usize,
}

#[derive(Serialize)]
struct SeedResult {
    seed: u64,
    elapsed_secs: f64,
    summary: RunSummary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(evotrader::logging::env_filter("seed_sweep=info,evotrader=warn"))
        .try_init()?;

    let args = Args::parse();
    let dataset = {
        let (path, start, end) = (args.dataset.clone(), args.start_date, args.end_date);
        task::spawn_blocking(move || Dataset::load(&path, start, end)).await??
    };
    std::fs::create_dir_all(&args.out_dir)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; every run will checkpoint and stop");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let parallel_runs = args.parallel_runs.max(1);
    let threads_per_run = (num_cpus::get() / parallel_runs).max(1);
    info!(
        "Sweeping {} seeds, {} at a time with {} threads each",
        args.seeds.len(),
        parallel_runs,
        threads_per_run
    );
    let start = Instant::now();

    stream::iter(args.seeds.clone())
        .map(|seed| {
            let mut config = SimulationConfig::new(
                args.dataset.clone(),
                args.start_date,
                args.end_date,
                args.out_dir.join(format!("seed_{seed}")),
            );
            config.population_size = args.population;
            config.survival_rate = args.survival_rate;
            config.elitism = args.elitism;
            config.seed = Some(seed);
            config.max_concurrency = threads_per_run;
            let dataset = dataset.clone();
            let stop = stop.clone();
            let generations = args.generations;
            let out_dir = args.out_dir.clone();

            async move {
                info!("Run for seed {seed} was launched");
                let began = Instant::now();
                let summary = task::spawn_blocking(move || {
                    config.save(&config.save_dir)?;
                    let mut engine = SimulationEngine::with_dataset(config, dataset)?;
                    anyhow::Ok(engine.run(&stop, Some(generations))?)
                })
                .await
                .context("blocking task panicked")??;

                let result = SeedResult {
                    seed,
                    elapsed_secs: began.elapsed().as_secs_f64(),
                    summary,
                };
                let json = serde_json::to_string_pretty(&result)?;
                let filename = out_dir.join(format!("sweep_seed_{seed}.json"));
                task::spawn_blocking(move || std::fs::write(filename, json)).await??;

                anyhow::Ok(result)
            }
        })
        // at most `parallel_runs` engines at once
        .buffer_unordered(parallel_runs)
        .for_each(|res| async {
            match res {
                Ok(result) => match result.summary.last_statistics {
                    Some(stats) => info!(
                        "seed {}: best = ${:.2}, average = ${:.2} after {} generations",
                        result.seed,
                        stats.best_wealth,
                        stats.average_wealth,
                        result.summary.generations_completed
                    ),
                    None => info!("seed {}: stopped before any generation completed", result.seed),
                },
                Err(e) => error!("sweep run failed: {e:#}"),
            }
        })
        .await;

    info!("Total sweep time: {:.2?}", start.elapsed());
    Ok(())
}
