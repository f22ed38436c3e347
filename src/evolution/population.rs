use super::schedule::{MutationParameters, MutationSchedule};
use super::statistics::GenerationStatistics;
use super::EvolutionError;
use crate::agent::{Agent, TradeRecord};
use rand::prelude::*;
use std::cmp::Ordering;
use tracing::debug;

/// Knobs that shape how one population turns into the next.
#[derive(Debug, Clone)]
pub struct EvolutionSettings {
    pub survival_rate: f64,
    pub schedule: MutationSchedule,
    /// Copy survivors into the next generation unmutated.
    pub elitism: bool,
    pub initial_fiat: f64,
}

/// What `Population::evolve` observed about the generation it just replaced.
#[derive(Debug, Clone)]
pub struct EvolutionOutcome {
    /// Index of the generation that was evaluated.
    pub generation: usize,
    pub statistics: GenerationStatistics,
    pub mutation: MutationParameters,
    pub best_agent_history: Vec<TradeRecord>,
}

#[derive(Debug, Clone)]
pub struct Population {
    agents: Vec<Agent>,
    generation: usize,
}

/// Number of agents kept per generation: `floor(size * rate)`, never zero.
///
/// # Arguments
/// * `population_size` - Agents in the evaluated generation.
/// * `survival_rate` - Fraction kept, exclusive of both 0 and 1.
pub fn survivor_count(population_size: usize, survival_rate: f64) -> Result<usize, EvolutionError> {
    if population_size == 0 {
        return Err(EvolutionError::BadPopulationParameter(
            "Population size cannot be zero".into(),
        ));
    }
    if !(survival_rate > 0.0 && survival_rate < 1.0) {
        return Err(EvolutionError::BadPopulationParameter(format!(
            "Survival rate must lie strictly between 0 and 1, got {survival_rate}"
        )));
    }
    let count = (population_size as f64 * survival_rate).floor() as usize;
    if count == 0 {
        return Err(EvolutionError::BadPopulationParameter(format!(
            "A survival rate of {survival_rate} keeps no agent out of {population_size}"
        )));
    }
    Ok(count)
}

/// Builds `target_size` offspring from `survivors`.
///
/// With elitism every survivor is first carried over unmutated (in rank
/// order). The remaining slots are clones of uniformly drawn survivors,
/// drawn with replacement, each mutated with `params`.
pub fn reproduce<R: Rng + ?Sized>(
    survivors: &[Agent],
    target_size: usize,
    params: MutationParameters,
    elitism: bool,
    initial_fiat: f64,
    rng: &mut R,
) -> Result<Vec<Agent>, EvolutionError> {
    if survivors.is_empty() {
        return Err(EvolutionError::NoSurvivors);
    }
    let mut offspring = Vec::with_capacity(target_size);

    if elitism {
        offspring.extend(
            survivors
                .iter()
                .take(target_size)
                .map(|elite| elite.offspring(initial_fiat)),
        );
    }

    while offspring.len() < target_size {
        let parent = survivors.choose(rng).ok_or(EvolutionError::NoSurvivors)?;
        let mut child = parent.offspring(initial_fiat);
        child.model_mut().mutate(params.rate, params.scale, rng);
        offspring.push(child);
    }

    Ok(offspring)
}

impl Population {
    /// Creates `population_size` random agents for generation 0.
    pub fn initialize<R: Rng + ?Sized>(
        population_size: usize,
        initial_fiat: f64,
        rng: &mut R,
    ) -> Result<Self, EvolutionError> {
        if population_size == 0 {
            return Err(EvolutionError::BadPopulationParameter(
                "Population size cannot be zero".into(),
            ));
        }
        let agents = (0..population_size)
            .map(|_| Agent::random(initial_fiat, rng))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Population {
            agents,
            generation: 0,
        })
    }

    pub fn from_agents(agents: Vec<Agent>, generation: usize) -> Result<Self, EvolutionError> {
        if agents.is_empty() {
            return Err(EvolutionError::BadPopulationParameter(
                "A population needs at least one agent".into(),
            ));
        }
        Ok(Population { agents, generation })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut [Agent] {
        &mut self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Index of the next generation to be evaluated.
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn reset_wallets(&mut self, initial_fiat: f64) {
        self.agents
            .iter_mut()
            .for_each(|agent| agent.reset_wallet(initial_fiat));
    }

    /// Orders agents by final wealth, richest first. The sort is stable, so
    /// agents with equal wealth keep their current relative order. NaN wealth
    /// ranks last.
    pub fn rank(&mut self) {
        self.agents.sort_by(compare_wealth);
    }

    /// The top `floor(len * survival_rate)` agents. Only meaningful after
    /// `rank`.
    pub fn select_survivors(&self, survival_rate: f64) -> Result<&[Agent], EvolutionError> {
        let keep = survivor_count(self.agents.len(), survival_rate)?;
        Ok(&self.agents[..keep])
    }

    pub fn statistics(&self) -> GenerationStatistics {
        let wealths: Vec<f64> = self.agents.iter().map(Agent::total_wealth).collect();
        GenerationStatistics::from_wealths(&wealths)
    }

    /// Replaces the evaluated population by its offspring and advances the
    /// generation counter.
    pub fn evolve<R: Rng + ?Sized>(
        &mut self,
        settings: &EvolutionSettings,
        rng: &mut R,
    ) -> Result<EvolutionOutcome, EvolutionError> {
        let population_size = self.agents.len();

        self.rank();
        let survivors = self.select_survivors(settings.survival_rate)?;
        let keep = survivors.len();
        let statistics = self.statistics();
        let mutation = settings
            .schedule
            .parameters(self.generation, statistics.wealth_std_dev);
        let best_agent_history = survivors[0].trade_history().to_vec();

        // --- Reproduction ---
        let next = reproduce(
            survivors,
            population_size,
            mutation,
            settings.elitism,
            settings.initial_fiat,
            rng,
        )?;
        debug!(
            "Generation {}: kept {} of {}, mutation rate {:.3} scale {:.3}{}",
            self.generation,
            keep,
            population_size,
            mutation.rate,
            mutation.scale,
            if mutation.boosted { " (boosted)" } else { "" }
        );

        let outcome = EvolutionOutcome {
            generation: self.generation,
            statistics,
            mutation,
            best_agent_history,
        };
        self.agents = next;
        self.generation += 1;
        Ok(outcome)
    }
}

fn ranking_key(agent: &Agent) -> f64 {
    let wealth = agent.total_wealth();
    if wealth.is_nan() {
        f64::NEG_INFINITY
    } else {
        wealth
    }
}

fn compare_wealth(a: &Agent, b: &Agent) -> Ordering {
    ranking_key(b).total_cmp(&ranking_key(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketFeatures;
    use chrono::NaiveDate;
    use rand::rngs::StdRng;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
    }

    fn features() -> MarketFeatures {
        MarketFeatures {
            sin_month: 0.1,
            cos_month: -0.4,
            sin_doy: 0.3,
            cos_doy: 0.9,
            sin_dow: -0.2,
            cos_dow: 0.5,
            year_scaled: 0.6,
            fear_greed: 0.25,
        }
    }

    /// Population whose agent `i` ends with wealth `wealths[i]`.
    fn population_with_wealths(wealths: &[f64], rng: &mut StdRng) -> Population {
        let mut population = Population::initialize(wealths.len(), 1000.0, rng).unwrap();
        for (agent, &target) in population.agents_mut().iter_mut().zip(wealths) {
            agent.reset_wallet(target);
        }
        population
    }

    fn settings(elitism: bool) -> EvolutionSettings {
        EvolutionSettings {
            survival_rate: 0.2,
            schedule: MutationSchedule::default(),
            elitism,
            initial_fiat: 1000.0,
        }
    }

    #[test]
    fn test_initialize_rejects_zero_size() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            Population::initialize(0, 1000.0, &mut rng),
            Err(EvolutionError::BadPopulationParameter(_))
        ));
    }

    #[test]
    fn test_survivor_count_floors_and_rejects_zero() {
        assert_eq!(survivor_count(100, 0.2).unwrap(), 20);
        assert_eq!(survivor_count(7, 0.5).unwrap(), 3);
        assert!(survivor_count(3, 0.2).is_err());
        assert!(survivor_count(10, 1.0).is_err());
        assert!(survivor_count(10, 0.0).is_err());
    }

    #[test]
    fn test_rank_is_stable_descending() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut population = population_with_wealths(&[5.0, 9.0, 5.0, f64::NAN, 7.0], &mut rng);
        let before: Vec<f64> = population
            .agents()
            .iter()
            .map(|a| a.decide(&features()))
            .collect();
        population.rank();

        let wealths: Vec<f64> = population.agents().iter().map(Agent::total_wealth).collect();
        assert_eq!(&wealths[..4], &[9.0, 7.0, 5.0, 5.0]);
        assert!(wealths[4].is_nan());
        // The two agents at 5.0 keep their original order (indices 0 then 2).
        assert_eq!(population.agents()[2].decide(&features()), before[0]);
        assert_eq!(population.agents()[3].decide(&features()), before[2]);
    }

    #[test]
    fn test_evolve_keeps_size_and_advances_generation() {
        let mut rng = StdRng::seed_from_u64(2);
        let wealths: Vec<f64> = (0..20).map(|i| 900.0 + 10.0 * i as f64).collect();
        let mut population = population_with_wealths(&wealths, &mut rng);

        let outcome = population.evolve(&settings(false), &mut rng).unwrap();
        assert_eq!(population.len(), 20);
        assert_eq!(population.generation(), 1);
        assert_eq!(outcome.generation, 0);
        assert_eq!(outcome.statistics.best_wealth, 1090.0);
        assert_eq!(outcome.statistics.worst_wealth, 900.0);
        assert!(population
            .agents()
            .iter()
            .all(|a| a.total_wealth() == 1000.0 && a.trade_history().is_empty()));
    }

    #[test]
    fn test_elitism_retains_best_model_unchanged() {
        let mut rng = StdRng::seed_from_u64(3);
        let wealths: Vec<f64> = (0..10).map(|i| 1000.0 + i as f64).collect();
        let mut population = population_with_wealths(&wealths, &mut rng);
        let best_decision = population.agents()[9].decide(&features());

        population.evolve(&settings(true), &mut rng).unwrap();
        assert_eq!(population.agents()[0].decide(&features()), best_decision);
    }

    #[test]
    fn test_offspring_descend_from_survivors_only() {
        let mut rng = StdRng::seed_from_u64(4);
        let wealths: Vec<f64> = (0..10).map(|i| 1000.0 + i as f64).collect();
        let mut population = population_with_wealths(&wealths, &mut rng);
        let survivor_architectures: Vec<Vec<usize>> = population.agents()[8..]
            .iter()
            .map(|a| a.model().architecture())
            .collect();

        population.evolve(&settings(false), &mut rng).unwrap();
        for agent in population.agents() {
            assert!(survivor_architectures.contains(&agent.model().architecture()));
        }
    }

    #[test]
    fn test_select_survivors_keeps_the_richest() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut population = population_with_wealths(&[3.0, 1.0, 8.0, 2.0, 5.0], &mut rng);
        population.rank();
        let survivors = population.select_survivors(0.5).unwrap();
        let kept: Vec<f64> = survivors.iter().map(Agent::total_wealth).collect();
        assert_eq!(kept, vec![8.0, 5.0]);
        assert!(population.select_survivors(0.1).is_err());
    }

    #[test]
    fn test_reproduce_fills_population_exactly() {
        let mut rng = StdRng::seed_from_u64(8);
        let params = MutationSchedule::default().parameters(0, 10.0);
        for &(size, rate) in &[(2, 0.5), (5, 0.2), (7, 0.5), (10, 0.3), (33, 0.9), (50, 0.99)] {
            let population = Population::initialize(size, 1000.0, &mut rng).unwrap();
            let kept = survivor_count(size, rate).unwrap();
            let survivors = &population.agents()[..kept];
            for elitism in [false, true] {
                let offspring =
                    reproduce(survivors, size, params, elitism, 1000.0, &mut rng).unwrap();
                assert_eq!(
                    offspring.len(),
                    size,
                    "size {size}, rate {rate}, elitism {elitism}"
                );
            }
        }
    }

    #[test]
    fn test_reproduce_without_survivors_fails() {
        let mut rng = StdRng::seed_from_u64(5);
        let params = MutationSchedule::default().parameters(0, 10.0);
        assert!(matches!(
            reproduce(&[], 4, params, false, 1000.0, &mut rng),
            Err(EvolutionError::NoSurvivors)
        ));
    }

    #[test]
    fn test_best_agent_history_is_captured() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut population = Population::initialize(5, 1000.0, &mut rng).unwrap();
        population.agents_mut()[3].execute_trade(1.0, 10.0, day()).unwrap();
        population.agents_mut()[3].sell_all(20.0, day()).unwrap();

        let outcome = population.evolve(&settings(false), &mut rng).unwrap();
        assert_eq!(outcome.best_agent_history.len(), 2);
        assert_eq!(outcome.statistics.best_wealth, 2000.0);
    }
}
