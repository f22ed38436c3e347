use crate::consts::{FEATURE_COUNT, INITIAL_WEIGHT_SCALE, OUTPUT_WIDTH};
use ndarray::{Array1, Array2};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use thiserror::Error;

/// Fixed-order input to every decision model.
pub type FeatureVector = [f64; FEATURE_COUNT];

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("Architecture needs at least an input and an output layer, got {0:?}")]
    ArchitectureTooShort(Vec<usize>),
    #[error("Layer sizes must be positive, got {0:?}")]
    ZeroWidthLayer(Vec<usize>),
    #[error("Input width must be {expected}, got {found}")]
    BadInputWidth { expected: usize, found: usize },
    #[error("Output width must be {expected}, got {found}")]
    BadOutputWidth { expected: usize, found: usize },
    #[error("Layer {layer} weights have shape {found:?}, architecture declares {expected:?}")]
    ShapeMismatch {
        layer: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Expected {expected} {what}, found {found}")]
    LayerCountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Layer {layer} must use {expected:?} activation, found {found:?}")]
    BadActivation {
        layer: usize,
        expected: Activation,
        found: Activation,
    },
    #[error("Layer {0} contains non-finite weights")]
    NonFiniteWeights(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

impl Activation {
    fn apply(self, signal: &mut Array1<f64>) {
        match self {
            Activation::Relu => signal.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => signal.mapv_inplace(f64::tanh),
        }
    }

    /// The last layer squashes to (-1, 1); every hidden layer is rectified.
    fn for_layer(layer: usize, layer_count: usize) -> Self {
        if layer + 1 == layer_count {
            Activation::Tanh
        } else {
            Activation::Relu
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DenseLayer {
    weights: Array2<f64>,
    activation: Activation,
}

impl DenseLayer {
    fn forward(&self, input: &Array1<f64>) -> Array1<f64> {
        // No bias term: the layer is a pure matrix product followed by the activation.
        let mut signal = input.dot(&self.weights);
        self.activation.apply(&mut signal);
        signal
    }
}

/// On-disk form of a decision model. Field names match the historical
/// checkpoint layout so older snapshots keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedModel {
    pub architecture: Vec<usize>,
    /// Per layer, `in` rows of `out` weights each.
    pub weights: Vec<Vec<Vec<f64>>>,
    pub activations: Vec<Activation>,
}

/// Feed-forward network mapping a market feature vector to an action in (-1, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionModel {
    layers: Vec<DenseLayer>,
}

fn validate_architecture(layer_sizes: &[usize]) -> Result<(), ModelError> {
    if layer_sizes.len() < 2 {
        return Err(ModelError::ArchitectureTooShort(layer_sizes.to_vec()));
    }
    if layer_sizes.iter().any(|&size| size == 0) {
        return Err(ModelError::ZeroWidthLayer(layer_sizes.to_vec()));
    }
    if layer_sizes[0] != FEATURE_COUNT {
        return Err(ModelError::BadInputWidth {
            expected: FEATURE_COUNT,
            found: layer_sizes[0],
        });
    }
    let output = layer_sizes[layer_sizes.len() - 1];
    if output != OUTPUT_WIDTH {
        return Err(ModelError::BadOutputWidth {
            expected: OUTPUT_WIDTH,
            found: output,
        });
    }
    Ok(())
}

impl DecisionModel {
    /// Builds one layer per consecutive pair of `layer_sizes`, with weights drawn
    /// from a zero-mean gaussian scaled down to `INITIAL_WEIGHT_SCALE`.
    pub fn new<R: Rng + ?Sized>(layer_sizes: &[usize], rng: &mut R) -> Result<Self, ModelError> {
        validate_architecture(layer_sizes)?;
        let initializer = Normal::standard();

        let layer_count = layer_sizes.len() - 1;
        let layers = layer_sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| DenseLayer {
                weights: Array2::from_shape_simple_fn((pair[0], pair[1]), || {
                    initializer.sample(rng) * INITIAL_WEIGHT_SCALE
                }),
                activation: Activation::for_layer(i, layer_count),
            })
            .collect();

        Ok(DecisionModel { layers })
    }

    /// Runs the feature vector through every layer in order and returns the
    /// final scalar, which lies in (-1, 1) thanks to the closing tanh.
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        let mut signal = Array1::from(features.to_vec());
        for layer in &self.layers {
            signal = layer.forward(&signal);
        }
        signal[0]
    }

    /// Adds gaussian noise N(0, `mutation_scale`) to each layer's weights
    /// independently with probability `mutation_rate`.
    pub fn mutate<R: Rng + ?Sized>(&mut self, mutation_rate: f64, mutation_scale: f64, rng: &mut R) {
        let rate = mutation_rate.clamp(0.0, 1.0);
        // A zero-width gaussian is the identity, and statrs rejects it anyway.
        let noise = match Normal::new(0.0, mutation_scale) {
            Ok(noise) => noise,
            Err(_) => return,
        };

        for layer in self.layers.iter_mut() {
            if rng.gen_bool(rate) {
                layer.weights.mapv_inplace(|w| w + noise.sample(rng));
            }
        }
    }

    /// Layer widths from input to output, e.g. `[8, 16, 1]`.
    pub fn architecture(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.layers.iter().map(|l| l.weights.nrows()).collect();
        if let Some(last) = self.layers.last() {
            sizes.push(last.weights.ncols());
        }
        sizes
    }

    pub fn serialize(&self) -> SerializedModel {
        SerializedModel {
            architecture: self.architecture(),
            weights: self
                .layers
                .iter()
                .map(|layer| layer.weights.outer_iter().map(|row| row.to_vec()).collect())
                .collect(),
            activations: self.layers.iter().map(|layer| layer.activation).collect(),
        }
    }

    /// Rebuilds a model, checking that every weight matrix matches the declared
    /// architecture and that the activations follow the relu…relu,tanh layout.
    pub fn deserialize(data: &SerializedModel) -> Result<Self, ModelError> {
        validate_architecture(&data.architecture)?;
        let layer_count = data.architecture.len() - 1;
        if data.weights.len() != layer_count {
            return Err(ModelError::LayerCountMismatch {
                what: "weight matrices",
                expected: layer_count,
                found: data.weights.len(),
            });
        }
        if data.activations.len() != layer_count {
            return Err(ModelError::LayerCountMismatch {
                what: "activations",
                expected: layer_count,
                found: data.activations.len(),
            });
        }

        let mut layers = Vec::with_capacity(layer_count);
        for (i, (rows, &activation)) in data.weights.iter().zip(&data.activations).enumerate() {
            let expected = (data.architecture[i], data.architecture[i + 1]);
            let found_cols = rows.first().map(Vec::len).unwrap_or(0);
            if rows.len() != expected.0 || rows.iter().any(|row| row.len() != expected.1) {
                return Err(ModelError::ShapeMismatch {
                    layer: i,
                    expected,
                    found: (rows.len(), found_cols),
                });
            }
            let wanted = Activation::for_layer(i, layer_count);
            if activation != wanted {
                return Err(ModelError::BadActivation {
                    layer: i,
                    expected: wanted,
                    found: activation,
                });
            }
            let flat: Vec<f64> = rows.iter().flatten().copied().collect();
            if flat.iter().any(|w| !w.is_finite()) {
                return Err(ModelError::NonFiniteWeights(i));
            }
            let weights = Array2::from_shape_vec(expected, flat).map_err(|_| {
                ModelError::ShapeMismatch {
                    layer: i,
                    expected,
                    found: (rows.len(), found_cols),
                }
            })?;
            layers.push(DenseLayer { weights, activation });
        }

        Ok(DecisionModel { layers })
    }
}

impl std::fmt::Display for DecisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arch = self
            .architecture()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("→");
        write!(f, "DecisionModel({arch})")
    }
}
