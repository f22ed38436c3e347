// Modules
pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod consts;
pub mod engine;
pub mod evolution;
pub mod logging;
pub mod market;
pub mod model;
pub mod prepare;
pub mod reporting;

pub use agent::{Agent, TradeError, TradeRecord};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use config::{ConfigError, ConfigValidationError, SimulationConfig};
pub use engine::{EngineError, EngineState, RunSummary, SimulationEngine, StopReason};
pub use evolution::{GenerationStatistics, MutationParameters, MutationSchedule, Population};
pub use market::{Dataset, DatasetLoadError, MarketFeatures, MarketTick};
pub use model::{DecisionModel, ModelError};
pub use reporting::{ChannelObserver, GenerationObserver, GenerationReport};
