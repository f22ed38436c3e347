use crate::checkpoint::write_atomic;
use crate::consts::{CONFIG_FILE, DEFAULT_CHECKPOINT_FILE, DEFAULT_INITIAL_FIAT};
use crate::evolution::population::survivor_count;
use crate::evolution::{EvolutionSettings, MutationSchedule};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("Start date {start} must be before end date {end}")]
    InvertedWindow { start: NaiveDate, end: NaiveDate },
    #[error("Population size must be greater than zero")]
    EmptyPopulation,
    #[error("Survival rate must lie strictly between 0 and 1, got {0}")]
    SurvivalRate(f64),
    #[error("Survival rate {survival_rate} keeps no agent out of {population_size}")]
    NoSurvivors {
        population_size: usize,
        survival_rate: f64,
    },
    #[error("Save interval must be greater than zero")]
    SaveInterval,
    #[error("Initial fiat must be positive and finite, got {0}")]
    InitialFiat(f64),
    #[error("Max concurrency must be greater than zero")]
    MaxConcurrency,
    #[error("Invalid mutation schedule: {0}")]
    MutationSchedule(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O failed on `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Config `{path}` is malformed: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
}

fn default_population_size() -> usize {
    100
}
fn default_survival_rate() -> f64 {
    0.2
}
fn default_save_interval() -> usize {
    10
}
fn default_initial_fiat() -> f64 {
    DEFAULT_INITIAL_FIAT
}
fn default_max_concurrency() -> usize {
    num_cpus::get()
}
fn default_checkpoint_file() -> String {
    DEFAULT_CHECKPOINT_FILE.to_string()
}

/// Everything a run needs, persisted next to its checkpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub dataset_path: PathBuf,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub save_dir: PathBuf,
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_survival_rate")]
    pub survival_rate: f64,
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    /// Seed for every random draw of the run. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_initial_fiat")]
    pub initial_fiat: f64,
    #[serde(default)]
    pub elitism: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,
    #[serde(default)]
    pub mutation: MutationSchedule,
}

impl SimulationConfig {
    /// Config with every optional field at its default.
    pub fn new(
        dataset_path: impl Into<PathBuf>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        save_dir: impl Into<PathBuf>,
    ) -> Self {
        SimulationConfig {
            dataset_path: dataset_path.into(),
            start_date,
            end_date,
            save_dir: save_dir.into(),
            population_size: default_population_size(),
            survival_rate: default_survival_rate(),
            save_interval: default_save_interval(),
            seed: None,
            initial_fiat: default_initial_fiat(),
            elitism: false,
            max_concurrency: default_max_concurrency(),
            checkpoint_file: default_checkpoint_file(),
            mutation: MutationSchedule::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.start_date >= self.end_date {
            return Err(ConfigValidationError::InvertedWindow {
                start: self.start_date,
                end: self.end_date,
            });
        }
        if self.population_size == 0 {
            return Err(ConfigValidationError::EmptyPopulation);
        }
        if !(self.survival_rate > 0.0 && self.survival_rate < 1.0) {
            return Err(ConfigValidationError::SurvivalRate(self.survival_rate));
        }
        if survivor_count(self.population_size, self.survival_rate).is_err() {
            return Err(ConfigValidationError::NoSurvivors {
                population_size: self.population_size,
                survival_rate: self.survival_rate,
            });
        }
        if self.save_interval == 0 {
            return Err(ConfigValidationError::SaveInterval);
        }
        if !(self.initial_fiat.is_finite() && self.initial_fiat > 0.0) {
            return Err(ConfigValidationError::InitialFiat(self.initial_fiat));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigValidationError::MaxConcurrency);
        }
        if let Some(problem) = self.mutation.check() {
            return Err(ConfigValidationError::MutationSchedule(problem));
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.save_dir.join(&self.checkpoint_file)
    }

    pub fn evolution_settings(&self) -> EvolutionSettings {
        EvolutionSettings {
            survival_rate: self.survival_rate,
            schedule: self.mutation.clone(),
            elitism: self.elitism,
            initial_fiat: self.initial_fiat,
        }
    }

    /// Validates, then writes the config into `dir` (created if missing).
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        self.validate()?;
        let path = dir.join(CONFIG_FILE);
        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json).map_err(io_err)?;
        info!("Saved simulation config to {}", path.display());
        Ok(path)
    }

    /// Reads and validates the config stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let bytes = fs::read(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: SimulationConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }
}
