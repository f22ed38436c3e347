use crate::agent::TradeRecord;
use crate::evolution::{EvolutionOutcome, GenerationStatistics, MutationParameters};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::warn;

/// Emitted once per completed generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub generation: usize,
    pub statistics: GenerationStatistics,
    /// Parameters used to breed the next generation.
    pub mutation: MutationParameters,
    pub best_agent_history: Vec<TradeRecord>,
}

impl From<EvolutionOutcome> for GenerationReport {
    fn from(outcome: EvolutionOutcome) -> Self {
        GenerationReport {
            generation: outcome.generation,
            statistics: outcome.statistics,
            mutation: outcome.mutation,
            best_agent_history: outcome.best_agent_history,
        }
    }
}

/// Receives generation reports from the engine. Implementations must return
/// quickly; the engine calls them on its own thread between generations.
pub trait GenerationObserver: Send {
    fn on_generation(&mut self, report: &GenerationReport);
}

/// Forwards every report over an unbounded channel.
pub struct ChannelObserver {
    sender: Sender<GenerationReport>,
    disconnected: bool,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<GenerationReport>) {
        let (sender, receiver) = mpsc::channel();
        (
            ChannelObserver {
                sender,
                disconnected: false,
            },
            receiver,
        )
    }
}

impl GenerationObserver for ChannelObserver {
    fn on_generation(&mut self, report: &GenerationReport) {
        if self.disconnected {
            return;
        }
        if self.sender.send(report.clone()).is_err() {
            warn!("Report receiver dropped; no further generation reports will be sent");
            self.disconnected = true;
        }
    }
}
