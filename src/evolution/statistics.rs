use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Wealth summary of one evaluated population.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GenerationStatistics {
    pub best_wealth: f64,
    pub average_wealth: f64,
    pub worst_wealth: f64,
    /// Population standard deviation of final wealth.
    pub wealth_std_dev: f64,
}

impl GenerationStatistics {
    pub fn from_wealths(wealths: &[f64]) -> Self {
        let (worst_wealth, best_wealth) = match wealths.iter().copied().minmax() {
            MinMaxResult::NoElements => (0.0, 0.0),
            MinMaxResult::OneElement(w) => (w, w),
            MinMaxResult::MinMax(min, max) => (min, max),
        };
        if wealths.is_empty() {
            return GenerationStatistics {
                best_wealth,
                average_wealth: 0.0,
                worst_wealth,
                wealth_std_dev: 0.0,
            };
        }

        GenerationStatistics {
            best_wealth,
            average_wealth: Statistics::mean(wealths.iter()),
            worst_wealth,
            wealth_std_dev: Statistics::population_std_dev(wealths.iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_summary_of_known_wealths() {
        let stats = GenerationStatistics::from_wealths(&[900.0, 1000.0, 1100.0, 1000.0]);
        assert_eq!(stats.best_wealth, 1100.0);
        assert_eq!(stats.worst_wealth, 900.0);
        assert_relative_eq!(stats.average_wealth, 1000.0);
        assert_relative_eq!(stats.wealth_std_dev, 5000.0_f64.sqrt());
    }

    #[test]
    fn test_single_agent_has_zero_spread() {
        let stats = GenerationStatistics::from_wealths(&[1234.0]);
        assert_eq!(stats.best_wealth, 1234.0);
        assert_eq!(stats.worst_wealth, 1234.0);
        assert_relative_eq!(stats.wealth_std_dev, 0.0);
    }
}
