use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use evotrader::reporting::GenerationReport;
use evotrader::{
    ChannelObserver, CheckpointStore, RunSummary, SimulationConfig, SimulationEngine, StopReason,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*};

const EXIT_INTERRUPTED: i32 = 130;

enum Outcome {
    Completed,
    Interrupted,
}

enum Launch {
    Fresh,
    /// Fail instead of creating a population when the checkpoint is missing.
    Resume,
}

#[derive(Parser)]
#[command(
    name = "evotrader",
    about = "Evolve neural trading agents against historical price and sentiment data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new simulation and start evolving.
    New {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        start_date: NaiveDate,
        #[arg(long)]
        end_date: NaiveDate,
        #[arg(long)]
        save_dir: PathBuf,
        #[arg(long, default_value_t = 100)]
        population: usize,
        #[arg(long, default_value_t = 0.2)]
        survival_rate: f64,
        #[arg(long, default_value_t = 10)]
        save_interval: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = false)]
        elitism: bool,
        /// Stop after this many generations instead of running until interrupted.
        #[arg(long)]
        generations: Option<usize>,
        /// Append one JSON line per generation to this file.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Resume a simulation from its save directory.
    Load {
        save_dir: PathBuf,
        #[arg(long)]
        generations: Option<usize>,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Join a daily price export with a Fear & Greed export by date.
    Merge {
        price: PathBuf,
        fear_greed: PathBuf,
        output: PathBuf,
    },
    /// Turn a merged raw price/sentiment CSV into the normalized dataset.
    Normalize {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = 2020)]
        min_year: i32,
        #[arg(long, default_value_t = 2023)]
        max_year: i32,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(Outcome::Completed) => 0,
        Ok(Outcome::Interrupted) => EXIT_INTERRUPTED,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            1
        }
    };
    process::exit(code);
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(evotrader::logging::env_filter("evotrader=info"))
        .try_init()?;
    Ok(())
}

async fn run() -> anyhow::Result<Outcome> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Command::New {
            dataset,
            start_date,
            end_date,
            save_dir,
            population,
            survival_rate,
            save_interval,
            seed,
            elitism,
            generations,
            report,
        } => {
            let mut config = SimulationConfig::new(dataset, start_date, end_date, save_dir.clone());
            config.population_size = population;
            config.survival_rate = survival_rate;
            config.save_interval = save_interval;
            config.seed = seed;
            config.elitism = elitism;
            config.validate()?;

            if CheckpointStore::new(config.checkpoint_path()).exists() {
                bail!(
                    "{} already holds a checkpoint; use `load` to resume it",
                    save_dir.display()
                );
            }
            config
                .save(&save_dir)
                .context("Could not persist the simulation config")?;
            drive(config, Launch::Fresh, generations, report).await
        }
        Command::Load {
            save_dir,
            generations,
            report,
        } => {
            let config = SimulationConfig::load(&save_dir)
                .with_context(|| format!("Could not load simulation from {}", save_dir.display()))?;
            drive(config, Launch::Resume, generations, report).await
        }
        Command::Merge {
            price,
            fear_greed,
            output,
        } => {
            let rows = task::spawn_blocking(move || {
                evotrader::prepare::merge_raw_csv(&price, &fear_greed, &output)
            })
            .await??;
            info!("Wrote {} merged rows", rows);
            Ok(Outcome::Completed)
        }
        Command::Normalize {
            input,
            output,
            min_year,
            max_year,
        } => {
            let rows = task::spawn_blocking(move || {
                evotrader::prepare::normalize_raw_csv(&input, &output, min_year, max_year)
            })
            .await??;
            info!("Wrote {} normalized rows", rows);
            Ok(Outcome::Completed)
        }
    }
}

async fn drive(
    config: SimulationConfig,
    launch: Launch,
    generations: Option<usize>,
    report: Option<PathBuf>,
) -> anyhow::Result<Outcome> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping at the next tick");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let (observer, reporter) = match report {
        Some(path) => {
            let (observer, receiver) = ChannelObserver::new();
            let writer = task::spawn_blocking(move || write_reports(path, receiver));
            (Some(observer), Some(writer))
        }
        None => (None, None),
    };

    let summary: RunSummary = task::spawn_blocking(move || {
        let mut engine = match launch {
            Launch::Fresh => SimulationEngine::start(config)?,
            Launch::Resume => SimulationEngine::resume(config)?,
        };
        if let Some(observer) = observer {
            engine.add_observer(Box::new(observer));
        }
        engine.run(&stop, generations)
    })
    .await??;

    if let Some(writer) = reporter {
        writer.await??;
    }

    if !summary.checkpoint_saved {
        warn!("The final checkpoint could not be written");
    }
    info!(
        "Stopped ({:?}) after {} generations; next generation is {}",
        summary.stop_reason, summary.generations_completed, summary.next_generation
    );
    Ok(match summary.stop_reason {
        StopReason::GenerationLimit => Outcome::Completed,
        StopReason::Interrupted => Outcome::Interrupted,
    })
}

fn write_reports(path: PathBuf, receiver: Receiver<GenerationReport>) -> anyhow::Result<()> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Could not open report file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for report in receiver {
        serde_json::to_writer(&mut out, &report)?;
        writeln!(out)?;
        out.flush()?;
    }
    Ok(())
}
