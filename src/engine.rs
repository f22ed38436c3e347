//! The generation loop: evaluate every agent over the dataset window, breed
//! the next population, checkpoint, repeat until stopped.

use crate::agent::{Agent, TradeError};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{ConfigValidationError, SimulationConfig};
use crate::evolution::{EvolutionError, GenerationStatistics, Population};
use crate::market::{Dataset, DatasetLoadError};
use crate::reporting::{GenerationObserver, GenerationReport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error(transparent)]
    Dataset(#[from] DatasetLoadError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Evolution(#[from] EvolutionError),
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("No checkpoint at `{0}` to resume from")]
    MissingCheckpoint(PathBuf),
    #[error("Could not build the evaluation thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    LoadCheckpoint,
    CreatePopulation,
    Ready,
    RunGeneration,
    Evaluate,
    Evolve,
    Checkpoint,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Interrupted,
    GenerationLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub generations_completed: usize,
    /// Counter the population was left at, i.e. the next generation to run.
    pub next_generation: usize,
    pub last_statistics: Option<GenerationStatistics>,
    pub checkpoint_saved: bool,
}

pub struct SimulationEngine {
    config: SimulationConfig,
    dataset: Dataset,
    population: Population,
    store: CheckpointStore,
    rng: StdRng,
    pool: rayon::ThreadPool,
    observers: Vec<Box<dyn GenerationObserver>>,
    state: EngineState,
    last_saved_generation: Option<usize>,
    non_finite_actions: usize,
}

impl SimulationEngine {
    /// Validates `config`, loads its dataset, then resumes from the stored
    /// checkpoint or creates and saves a fresh population.
    pub fn start(config: SimulationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let dataset = Dataset::load(&config.dataset_path, config.start_date, config.end_date)?;
        Self::with_dataset(config, dataset)
    }

    /// Like `start`, but refuses to create a fresh population: the save
    /// directory must already hold a checkpoint.
    pub fn resume(config: SimulationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let checkpoint_path = config.checkpoint_path();
        if !CheckpointStore::new(&checkpoint_path).exists() {
            return Err(EngineError::MissingCheckpoint(checkpoint_path));
        }
        Self::start(config)
    }

    pub fn with_dataset(config: SimulationConfig, dataset: Dataset) -> Result<Self, EngineError> {
        config.validate()?;
        debug!("Engine state: {:?}", EngineState::Init);
        let store = CheckpointStore::new(config.checkpoint_path());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .build()?;

        let (population, rng, state, saved) = if store.exists() {
            debug!("Engine state: {:?}", EngineState::LoadCheckpoint);
            let checkpoint = store.load()?;
            // Resumed runs continue the stream from a generation-specific seed.
            let mut rng = seeded_rng(config.seed, checkpoint.generation);
            let agents = resize_population(checkpoint.agents, &config, checkpoint.generation, &mut rng)?;
            let mut population = Population::from_agents(agents, checkpoint.generation)?;
            population.reset_wallets(config.initial_fiat);
            info!(
                "Resuming at generation {} with {} agents",
                population.generation(),
                population.len()
            );
            let generation = population.generation();
            (population, rng, EngineState::LoadCheckpoint, Some(generation))
        } else {
            debug!("Engine state: {:?}", EngineState::CreatePopulation);
            std::fs::create_dir_all(&config.save_dir).map_err(|source| CheckpointError::Io {
                path: config.save_dir.clone(),
                source,
            })?;
            let mut rng = seeded_rng(config.seed, 0);
            let population =
                Population::initialize(config.population_size, config.initial_fiat, &mut rng)?;
            store.save(0, &population)?;
            info!("Created a fresh population of {} agents", population.len());
            (population, rng, EngineState::CreatePopulation, Some(0))
        };

        let mut engine = SimulationEngine {
            config,
            dataset,
            population,
            store,
            rng,
            pool,
            observers: Vec::new(),
            state,
            last_saved_generation: saved,
            non_finite_actions: 0,
        };
        engine.transition(EngineState::Ready);
        Ok(engine)
    }

    pub fn add_observer(&mut self, observer: Box<dyn GenerationObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn generation(&self) -> usize {
        self.population.generation()
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Non-finite actions replaced by a hold during the last evaluation pass.
    pub fn non_finite_actions(&self) -> usize {
        self.non_finite_actions
    }

    fn transition(&mut self, next: EngineState) {
        debug!("Engine state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs every agent over the dataset window and liquidates at the last
    /// tick. Returns `false` when `stop` was raised before the pass finished;
    /// the partial pass is then discarded by the caller.
    pub fn run_generation(&mut self, stop: &AtomicBool) -> Result<bool, EngineError> {
        self.transition(EngineState::RunGeneration);
        let initial_fiat = self.config.initial_fiat;
        let generation = self.population.generation();
        let non_finite = AtomicUsize::new(0);
        let agents = self.population.agents_mut();
        agents
            .iter_mut()
            .for_each(|agent| agent.reset_wallet(initial_fiat));

        for tick in self.dataset.ticks() {
            if stop.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.pool.install(|| {
                agents.par_iter_mut().try_for_each(|agent| {
                    let action = agent.decide(&tick.features);
                    if !action.is_finite() {
                        non_finite.fetch_add(1, Ordering::Relaxed);
                    }
                    agent.execute_trade(action, tick.price, tick.date)
                })
            })?;
        }

        let last = self.dataset.last();
        agents
            .iter_mut()
            .try_for_each(|agent| agent.sell_all(last.price, last.date))?;

        self.non_finite_actions = non_finite.into_inner();
        if self.non_finite_actions > 0 {
            warn!(
                "Generation {}: {} non-finite actions were treated as holds",
                generation, self.non_finite_actions
            );
        }
        Ok(true)
    }

    /// Ranks the evaluated population, breeds the next one and notifies
    /// observers.
    pub fn evaluate_and_evolve(&mut self) -> Result<GenerationReport, EngineError> {
        self.transition(EngineState::Evaluate);
        let settings = self.config.evolution_settings();
        self.transition(EngineState::Evolve);
        let outcome = self.population.evolve(&settings, &mut self.rng)?;
        let report = GenerationReport::from(outcome);

        let stats = &report.statistics;
        info!(
            "Generation {}: best ${:.2}, average ${:.2}, worst ${:.2}, std dev {:.2} | mutation rate {:.3}, scale {:.3}",
            report.generation,
            stats.best_wealth,
            stats.average_wealth,
            stats.worst_wealth,
            stats.wealth_std_dev,
            report.mutation.rate,
            report.mutation.scale
        );
        for observer in self.observers.iter_mut() {
            observer.on_generation(&report);
        }
        Ok(report)
    }

    /// Saves when the generation counter is a multiple of the save interval.
    pub fn checkpoint_if_due(&mut self) -> Result<bool, EngineError> {
        let generation = self.population.generation();
        if generation % self.config.save_interval != 0 {
            return Ok(false);
        }
        self.save_checkpoint()?;
        Ok(true)
    }

    fn save_checkpoint(&mut self) -> Result<(), EngineError> {
        self.transition(EngineState::Checkpoint);
        let generation = self.population.generation();
        self.store.save(generation, &self.population)?;
        self.last_saved_generation = Some(generation);
        Ok(())
    }

    /// Loops until `stop` is raised or `max_generations` more generations
    /// have completed (`None` runs until interrupted).
    pub fn run(
        &mut self,
        stop: &AtomicBool,
        max_generations: Option<usize>,
    ) -> Result<RunSummary, EngineError> {
        let mut completed = 0;
        let mut last_statistics = None;

        loop {
            if max_generations.is_some_and(|limit| completed >= limit) {
                if self.last_saved_generation != Some(self.generation()) {
                    self.save_checkpoint()?;
                }
                self.transition(EngineState::Stopped);
                info!(
                    "Completed {} generations; next generation is {}",
                    completed,
                    self.generation()
                );
                return Ok(self.summary(StopReason::GenerationLimit, completed, last_statistics, true));
            }

            if stop.load(Ordering::SeqCst) || !self.run_generation(stop)? {
                return Ok(self.interrupt(completed, last_statistics));
            }

            let report = self.evaluate_and_evolve()?;
            last_statistics = Some(report.statistics);
            completed += 1;
            self.checkpoint_if_due()?;
            self.transition(EngineState::Ready);
        }
    }

    fn interrupt(&mut self, completed: usize, last_statistics: Option<GenerationStatistics>) -> RunSummary {
        info!(
            "Interrupted; saving generation {} before exit",
            self.generation()
        );
        self.population.reset_wallets(self.config.initial_fiat);
        let checkpoint_saved = match self.save_checkpoint() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save checkpoint on interrupt: {}", e);
                false
            }
        };
        self.transition(EngineState::Stopped);
        self.summary(StopReason::Interrupted, completed, last_statistics, checkpoint_saved)
    }

    fn summary(
        &self,
        stop_reason: StopReason,
        generations_completed: usize,
        last_statistics: Option<GenerationStatistics>,
        checkpoint_saved: bool,
    ) -> RunSummary {
        RunSummary {
            stop_reason,
            generations_completed,
            next_generation: self.generation(),
            last_statistics,
            checkpoint_saved,
        }
    }
}

/// Generation 0 uses `seed` as is. Resumes at a later counter mix the counter
/// in, so a resumed run draws a different stream than an uninterrupted one.
fn seeded_rng(seed: Option<u64>, generation: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(
            seed ^ (generation as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        ),
        None => StdRng::from_entropy(),
    }
}

/// Brings a restored population back to the configured size: extra agents
/// are dropped, missing ones are filled with random agents.
fn resize_population(
    mut agents: Vec<Agent>,
    config: &SimulationConfig,
    generation: usize,
    rng: &mut StdRng,
) -> Result<Vec<Agent>, EvolutionError> {
    let population_size = config.population_size;
    if agents.len() != population_size {
        warn!(
            "Warning: Population size mismatch ({}) in checkpoint for generation {}. Should be {}. Resizing.",
            agents.len(),
            generation,
            population_size
        );
        agents.truncate(population_size);
        while agents.len() < population_size {
            agents.push(Agent::random(config.initial_fiat, rng)?);
        }
    }
    Ok(agents)
}
