use thiserror::Error;

pub mod population;
pub mod schedule;
pub mod statistics;

pub use population::{EvolutionOutcome, EvolutionSettings, Population};
pub use schedule::{MutationParameters, MutationSchedule};
pub use statistics::GenerationStatistics;

#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("Invalid population parameters were passed: {0}")]
    BadPopulationParameter(String),
    #[error("Could not build a decision model: {0}")]
    Model(#[from] crate::model::ModelError),
    #[error("No survivors to reproduce from.")]
    NoSurvivors,
}
