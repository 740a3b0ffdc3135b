//! The network model: an immutable-shaped, mutable-valued stack of fully
//! connected layers.

use crate::{error::EvaluatorError, util, Float, Result};
use anyhow::{bail, ensure};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Activation function tag.
///
/// The taxonomy is open; sigmoid is the canonical member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Activation {
    Sigmoid,
}

impl Activation {
    /// `f(z)`.
    pub fn apply(&self, z: Float) -> Float {
        match self {
            Self::Sigmoid => 1. / (1. + (-z).exp()),
        }
    }
    /// `f'(z)`.
    pub fn derivative(&self, z: Float) -> Float {
        match self {
            Self::Sigmoid => {
                let sig = self.apply(z);
                sig * (1. - sig)
            }
        }
    }
    /// Stable tag uploaded to the device as per-layer metadata.
    pub(crate) fn tag(&self) -> u32 {
        match self {
            Self::Sigmoid => 0,
        }
    }
}

/// One fully connected layer.
///
/// Weights are laid out current-major: the weight connecting previous neuron
/// `p` to current neuron `c` lives at `c * previous_size + p`.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub size: usize,
    pub previous_size: usize,
    pub function: Activation,
    pub biases: Vec<Float>,
    pub weights: Vec<Float>,
}

impl Layer {
    /// A zero-valued layer of the given shape.
    pub fn zeroed(size: usize, previous_size: usize, function: Activation) -> Self {
        Self {
            size,
            previous_size,
            function,
            biases: vec![0.; size],
            weights: vec![0.; size * previous_size],
        }
    }

    pub fn bias(&self, current: usize) -> Float {
        self.biases[current]
    }

    pub fn bias_mut(&mut self, current: usize) -> &mut Float {
        &mut self.biases[current]
    }

    pub fn weight(&self, current: usize, previous: usize) -> Float {
        self.weights[current * self.previous_size + previous]
    }

    pub fn weight_mut(&mut self, current: usize, previous: usize) -> &mut Float {
        &mut self.weights[current * self.previous_size + previous]
    }
}

static NETWORK_IDS: AtomicU64 = AtomicU64::new(0);

/// Identity assigned at construction. Evaluators key per-network resources by
/// id rather than by address, so moving or re-borrowing a network never
/// aliases another one's device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(u64);

impl NetworkId {
    fn create() -> Self {
        Self(NETWORK_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// An ordered, non-empty sequence of dense layers.
///
/// The shape (sizes and activation tags) is fixed after construction; values
/// are mutated only by gradient composition.
#[derive(Debug)]
pub struct Network {
    id: NetworkId,
    input_count: usize,
    layers: Vec<Layer>,
}

impl Network {
    /// Validates and takes ownership of `layers`.
    pub fn new(layers: Vec<Layer>) -> Result<Self> {
        ensure!(!layers.is_empty(), EvaluatorError::EmptyNetwork);
        for (i, layer) in layers.iter().enumerate() {
            if layer.size == 0 || layer.previous_size == 0 {
                bail!("layer {} has a zero dimension", i);
            }
            if layer.biases.len() != layer.size
                || layer.weights.len() != layer.size * layer.previous_size
            {
                bail!(
                    "layer {} value counts do not match its shape ({} biases, {} weights)",
                    i,
                    layer.biases.len(),
                    layer.weights.len()
                );
            }
            if i > 0 && layer.previous_size != layers[i - 1].size {
                bail!(
                    "layer {} expects {} inputs but the previous layer has {} neurons",
                    i,
                    layer.previous_size,
                    layers[i - 1].size
                );
            }
        }
        Ok(Self {
            id: NetworkId::create(),
            input_count: layers[0].previous_size,
            layers,
        })
    }

    /// Creates a network of the given shape with uniformly random weights and
    /// biases in `[-1, 1]`, drawn from the shared process generator.
    ///
    /// `layer_sizes[0]` is the input width; each subsequent entry is a layer.
    pub fn randomize(layer_sizes: &[usize], function: Activation) -> Result<Self> {
        ensure!(layer_sizes.len() >= 2, EvaluatorError::EmptyNetwork);
        let mut layers = Vec::with_capacity(layer_sizes.len() - 1);
        for window in layer_sizes.windows(2) {
            let mut layer = Layer::zeroed(window[1], window[0], function);
            for bias in layer.biases.iter_mut() {
                *bias = util::uniform(-1., 1.);
            }
            for weight in layer.weights.iter_mut() {
                *weight = util::uniform(-1., 1.);
            }
            layers.push(layer);
        }
        Self::new(layers)
    }

    pub fn id(&self) -> NetworkId {
        self.id
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.layers.last().map(|layer| layer.size).unwrap_or(0)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Mutable access to layer values, used by gradient composition and the
    /// GPU readback path. The shape invariants still hold because `Layer`
    /// exposes only value mutation to safe callers.
    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_midpoint() {
        assert!((Activation::Sigmoid.apply(0.) - 0.5).abs() < 1e-6);
        assert!((Activation::Sigmoid.derivative(0.) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn weight_layout_is_current_major() {
        let mut layer = Layer::zeroed(2, 3, Activation::Sigmoid);
        *layer.weight_mut(1, 2) = 7.;
        assert_eq!(layer.weights[1 * 3 + 2], 7.);
        assert_eq!(layer.weight(1, 2), 7.);
    }

    #[test]
    fn randomize_shapes() {
        let nn = Network::randomize(&[4, 3, 2], Activation::Sigmoid).unwrap();
        assert_eq!(nn.input_count(), 4);
        assert_eq!(nn.output_count(), 2);
        assert_eq!(nn.layers().len(), 2);
        assert_eq!(nn.layers()[0].weights.len(), 12);
        assert!(nn
            .layers()
            .iter()
            .flat_map(|l| l.biases.iter().chain(l.weights.iter()))
            .all(|x| (-1. ..=1.).contains(x)));
    }

    #[test]
    fn rejects_mismatched_layers() {
        let layers = vec![
            Layer::zeroed(3, 2, Activation::Sigmoid),
            Layer::zeroed(1, 4, Activation::Sigmoid),
        ];
        assert!(Network::new(layers).is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(Network::new(Vec::new()).is_err());
    }

    #[test]
    fn ids_are_unique() {
        let a = Network::randomize(&[1, 1], Activation::Sigmoid).unwrap();
        let b = Network::randomize(&[1, 1], Activation::Sigmoid).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
