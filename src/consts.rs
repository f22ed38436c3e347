// Shared constants for the trading simulation.

/// Width of the per-tick feature vector fed to every decision model.
pub const FEATURE_COUNT: usize = 8;
/// Every decision model produces a single action scalar.
pub const OUTPUT_WIDTH: usize = 1;

/// Hidden layer counts a freshly generated agent can draw, with their weights.
pub const HIDDEN_LAYER_CHOICES: [usize; 3] = [0, 1, 2];
pub const HIDDEN_LAYER_WEIGHTS: [f64; 3] = [0.2, 0.5, 0.3];
/// Candidate widths for each hidden layer.
pub const HIDDEN_WIDTH_CHOICES: [usize; 3] = [4, 8, 16];

/// Standard deviation of the gaussian used to initialize weights.
pub const INITIAL_WEIGHT_SCALE: f64 = 0.1;

pub const DEFAULT_INITIAL_FIAT: f64 = 1000.0;
pub const DEFAULT_CHECKPOINT_FILE: &str = "generation.ckpt";
pub const CONFIG_FILE: &str = "simulation_config.json";
