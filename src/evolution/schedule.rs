use serde::{Deserialize, Serialize};

fn default_base_rate() -> f64 {
    0.3
}
fn default_decay_per_generation() -> f64 {
    0.002
}
fn default_floor_rate() -> f64 {
    0.05
}
fn default_max_rate() -> f64 {
    0.5
}
fn default_base_scale() -> f64 {
    0.2
}
fn default_diversity_threshold() -> f64 {
    1.0
}
fn default_boost_factor() -> f64 {
    2.0
}

/// Annealing policy for mutation hyperparameters.
///
/// The per-layer mutation rate decays linearly with the generation index down
/// to `floor_rate`. When the wealth spread of the evaluated population drops
/// below `diversity_threshold` the population is considered converged and both
/// rate and scale are multiplied by `boost_factor` to push exploration again.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MutationSchedule {
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,
    #[serde(default = "default_decay_per_generation")]
    pub decay_per_generation: f64,
    #[serde(default = "default_floor_rate")]
    pub floor_rate: f64,
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
    #[serde(default = "default_base_scale")]
    pub base_scale: f64,
    /// Standard deviation of final wealth, in fiat units.
    #[serde(default = "default_diversity_threshold")]
    pub diversity_threshold: f64,
    #[serde(default = "default_boost_factor")]
    pub boost_factor: f64,
}

impl Default for MutationSchedule {
    fn default() -> Self {
        MutationSchedule {
            base_rate: default_base_rate(),
            decay_per_generation: default_decay_per_generation(),
            floor_rate: default_floor_rate(),
            max_rate: default_max_rate(),
            base_scale: default_base_scale(),
            diversity_threshold: default_diversity_threshold(),
            boost_factor: default_boost_factor(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MutationParameters {
    pub rate: f64,
    pub scale: f64,
    /// True when the convergence boost was applied.
    pub boosted: bool,
}

impl MutationSchedule {
    pub fn parameters(&self, generation: usize, wealth_std_dev: f64) -> MutationParameters {
        let decayed = self.base_rate - self.decay_per_generation * generation as f64;
        let mut rate = decayed.max(self.floor_rate).min(self.max_rate);
        let mut scale = self.base_scale;

        // A NaN spread counts as converged.
        let boosted = !(wealth_std_dev >= self.diversity_threshold);
        if boosted {
            rate = (rate * self.boost_factor).min(self.max_rate);
            scale *= self.boost_factor;
        }

        MutationParameters {
            rate,
            scale,
            boosted,
        }
    }

    /// Returns a description of the first inconsistent field, if any.
    pub fn check(&self) -> Option<String> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.base_rate) || !in_unit(self.floor_rate) || !in_unit(self.max_rate) {
            return Some("mutation rates must lie in [0, 1]".into());
        }
        if self.floor_rate > self.max_rate {
            return Some(format!(
                "floor_rate {} exceeds max_rate {}",
                self.floor_rate, self.max_rate
            ));
        }
        if !(self.decay_per_generation >= 0.0) {
            return Some("decay_per_generation must be non-negative".into());
        }
        if !(self.base_scale > 0.0 && self.base_scale.is_finite()) {
            return Some("base_scale must be positive".into());
        }
        if !(self.diversity_threshold >= 0.0) {
            return Some("diversity_threshold must be non-negative".into());
        }
        if !(self.boost_factor >= 1.0 && self.boost_factor.is_finite()) {
            return Some("boost_factor must be at least 1".into());
        }
        None
    }
}
