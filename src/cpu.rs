//! The synchronous CPU reference evaluator.
//!
//! Every result is ready the instant `begin_*` returns, which makes this the
//! canonical implementation the GPU backend is checked against.

use crate::{
    error::EvaluatorError,
    evaluator::{cost_derivative, Evaluator, PassToken, ResultKey},
    network::{Layer, Network, NetworkId},
    Float, Result,
};
use anyhow::ensure;
use std::collections::HashMap;

/// Activations and pre-activations for one layer of one pass.
#[derive(Debug)]
struct LayerRecord {
    activations: Vec<Float>,
    z: Vec<Float>,
}

/// One forward pass: the raw inputs followed by one record per layer.
#[derive(Debug)]
struct PassRecord {
    inputs: Vec<Float>,
    layers: Vec<LayerRecord>,
}

#[derive(Debug)]
struct EvalResult {
    network: NetworkId,
    run_count: usize,
    passes: Vec<PassRecord>,
}

#[derive(Debug)]
struct BackpropResult {
    network: NetworkId,
    /// Per pass, per layer: a delta record shaped like the layer it applies
    /// to, holding `dC/db` in `biases` and `dC/dw` in `weights`.
    passes: Vec<Vec<Layer>>,
}

#[derive(Debug)]
enum CpuResult {
    Eval(EvalResult),
    Backprop(BackpropResult),
}

/// Synchronous reference implementation of [`Evaluator`].
#[derive(Debug, Default)]
pub struct CpuEvaluator {
    next_key: u64,
    results: HashMap<u64, CpuResult>,
    training: bool,
}

impl CpuEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of results currently held, ready or not. Diagnostic.
    pub fn outstanding_results(&self) -> usize {
        self.results.len()
    }

    fn next_key(&mut self) -> ResultKey {
        let key = self.next_key;
        self.next_key += 1;
        ResultKey(key)
    }

    fn eval_result(&self, key: ResultKey) -> Result<&EvalResult> {
        match self.results.get(&key.0) {
            Some(CpuResult::Eval(result)) => Ok(result),
            Some(CpuResult::Backprop(_)) => Err(EvaluatorError::NotAnEvalResult(key).into()),
            None => Err(EvaluatorError::UnknownResult(key).into()),
        }
    }

    fn forward(nn: &Network, inputs: &[Float]) -> PassRecord {
        let layers = nn.layers();
        let mut records: Vec<LayerRecord> = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let previous = if i > 0 {
                records[i - 1].activations.as_slice()
            } else {
                inputs
            };
            let mut record = LayerRecord {
                activations: vec![0.; layer.size],
                z: vec![0.; layer.size],
            };
            for c in 0..layer.size {
                let mut z = layer.bias(c);
                for p in 0..layer.previous_size {
                    z += layer.weight(c, p) * previous[p];
                }
                record.z[c] = z;
                record.activations[c] = layer.function.apply(z);
            }
            records.push(record);
        }
        PassRecord {
            inputs: inputs.to_vec(),
            layers: records,
        }
    }

    /// Backpropagates one pass, writing `dC/db` and `dC/dw` into per-layer
    /// delta records. Layers are walked from the output backwards; the
    /// previous iteration's `dC/dz` feeds the next one down.
    fn backward(nn: &Network, pass: &PassRecord, expected: &[Float]) -> Vec<Layer> {
        let layers = nn.layers();
        let mut deltas: Vec<Layer> = layers
            .iter()
            .map(|layer| Layer::zeroed(layer.size, layer.previous_size, layer.function))
            .collect();
        let mut dc_dz_next: Vec<Float> = Vec::new();
        for i in (0..layers.len()).rev() {
            let layer = &layers[i];
            let record = &pass.layers[i];
            let previous_activations = if i > 0 {
                pass.layers[i - 1].activations.as_slice()
            } else {
                pass.inputs.as_slice()
            };
            let mut dc_dz = vec![0.; layer.size];
            for c in 0..layer.size {
                let dc_da = if i == layers.len() - 1 {
                    cost_derivative(record.activations[c], expected[c])
                } else {
                    let next_layer = &layers[i + 1];
                    (0..next_layer.size)
                        .map(|n| next_layer.weight(n, c) * dc_dz_next[n])
                        .sum()
                };
                let d = dc_da * layer.function.derivative(record.z[c]);
                dc_dz[c] = d;
                *deltas[i].bias_mut(c) = d;
                for p in 0..layer.previous_size {
                    *deltas[i].weight_mut(c, p) = d * previous_activations[p];
                }
            }
            dc_dz_next = dc_dz;
        }
        deltas
    }
}

impl Evaluator for CpuEvaluator {
    fn is_result_ready(&self, key: ResultKey) -> bool {
        self.results.contains_key(&key.0)
    }

    fn free_result(&mut self, key: ResultKey) -> Result<()> {
        self.results
            .remove(&key.0)
            .map(|_| ())
            .ok_or_else(|| EvaluatorError::UnknownResult(key).into())
    }

    fn begin_eval(&mut self, nn: &Network, inputs: &[Float]) -> Result<ResultKey> {
        ensure!(!nn.layers().is_empty(), EvaluatorError::EmptyNetwork);
        let input_count = nn.input_count();
        ensure!(
            !inputs.is_empty() && inputs.len() % input_count == 0,
            EvaluatorError::InputSize {
                len: inputs.len(),
                input_count,
            }
        );
        let run_count = inputs.len() / input_count;
        let passes = inputs
            .chunks_exact(input_count)
            .map(|chunk| Self::forward(nn, chunk))
            .collect();
        let key = self.next_key();
        self.results.insert(
            key.0,
            CpuResult::Eval(EvalResult {
                network: nn.id(),
                run_count,
                passes,
            }),
        );
        Ok(key)
    }

    fn eval_pass(&self, key: ResultKey) -> Result<PassToken> {
        let result = self.eval_result(key)?;
        Ok(PassToken {
            pass: key.0,
            network: result.network,
        })
    }

    fn eval_outputs(&mut self, nn: &Network, pass: PassToken, outputs: &mut Vec<Float>) -> Result<()> {
        ensure!(pass.network == nn.id(), EvaluatorError::NetworkMismatch);
        let result = match self.results.get(&pass.pass) {
            Some(CpuResult::Eval(result)) => result,
            _ => return Err(EvaluatorError::UnknownPass.into()),
        };
        for record in &result.passes {
            let last = record.layers.last().expect("network layers are non-empty");
            outputs.extend_from_slice(&last.activations);
        }
        Ok(())
    }

    fn begin_backprop(
        &mut self,
        nn: &Network,
        pass: PassToken,
        expected: &[Float],
    ) -> Result<ResultKey> {
        ensure!(!nn.layers().is_empty(), EvaluatorError::EmptyNetwork);
        ensure!(pass.network == nn.id(), EvaluatorError::NetworkMismatch);
        let eval = match self.results.get(&pass.pass) {
            Some(CpuResult::Eval(result)) => result,
            _ => return Err(EvaluatorError::UnknownPass.into()),
        };
        let expected_len = nn.output_count() * eval.run_count;
        ensure!(
            expected.len() == expected_len,
            EvaluatorError::ExpectedOutputSize {
                len: expected.len(),
                expected: expected_len,
                run_count: eval.run_count,
            }
        );
        let output_count = nn.output_count();
        let passes = eval
            .passes
            .iter()
            .zip(expected.chunks_exact(output_count))
            .map(|(pass, expected)| Self::backward(nn, pass, expected))
            .collect();
        let key = self.next_key();
        self.results.insert(
            key.0,
            CpuResult::Backprop(BackpropResult {
                network: nn.id(),
                passes,
            }),
        );
        Ok(key)
    }

    fn compose_deltas(
        &mut self,
        nn: &mut Network,
        keys: &[ResultKey],
        scalar: Float,
        _copy: bool,
    ) -> Result<()> {
        // Validate every key up front so a bad one leaves the network
        // untouched. The canonical store is this same memory, so `copy` has
        // nothing to do.
        for key in keys {
            match self.results.get(&key.0) {
                Some(CpuResult::Backprop(result)) => {
                    ensure!(result.network == nn.id(), EvaluatorError::NetworkMismatch);
                }
                Some(CpuResult::Eval(_)) => {
                    return Err(EvaluatorError::NotABackpropResult(*key).into())
                }
                None => return Err(EvaluatorError::UnknownResult(*key).into()),
            }
        }
        for key in keys {
            let result = match self.results.get(&key.0) {
                Some(CpuResult::Backprop(result)) => result,
                _ => unreachable!("validated above"),
            };
            for deltas in &result.passes {
                for (layer, delta) in nn.layers_mut().iter_mut().zip(deltas) {
                    for (bias, db) in layer.biases.iter_mut().zip(&delta.biases) {
                        *bias -= db * scalar;
                    }
                    for (weight, dw) in layer.weights.iter_mut().zip(&delta.weights) {
                        *weight -= dw * scalar;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Activation;
    use approx::assert_relative_eq;

    fn zeroed(sizes: &[usize]) -> Network {
        let layers = sizes
            .windows(2)
            .map(|w| Layer::zeroed(w[1], w[0], Activation::Sigmoid))
            .collect();
        Network::new(layers).unwrap()
    }

    #[test]
    fn zero_network_outputs_half() {
        let nn = zeroed(&[2, 2]);
        let mut ev = CpuEvaluator::new();
        let key = ev.begin_eval(&nn, &[0., 0., 1., 1.]).unwrap();
        assert!(ev.is_result_ready(key));
        let pass = ev.eval_pass(key).unwrap();
        let mut outputs = Vec::new();
        ev.eval_outputs(&nn, pass, &mut outputs).unwrap();
        assert_eq!(outputs.len(), 4);
        for x in outputs {
            assert_relative_eq!(x, 0.5);
        }
    }

    #[test]
    fn rejects_bad_input_length() {
        let nn = zeroed(&[2, 1]);
        let mut ev = CpuEvaluator::new();
        assert!(ev.begin_eval(&nn, &[1., 2., 3.]).is_err());
        assert!(ev.begin_eval(&nn, &[]).is_err());
        assert_eq!(ev.outstanding_results(), 0);
    }

    #[test]
    fn rejects_foreign_network_pass() {
        let nn = zeroed(&[1, 1]);
        let other = zeroed(&[1, 1]);
        let mut ev = CpuEvaluator::new();
        let key = ev.begin_eval(&nn, &[1.]).unwrap();
        let pass = ev.eval_pass(key).unwrap();
        assert!(ev.begin_backprop(&other, pass, &[1.]).is_err());
    }

    #[test]
    fn double_free_fails() {
        let nn = zeroed(&[1, 1]);
        let mut ev = CpuEvaluator::new();
        let key = ev.begin_eval(&nn, &[1.]).unwrap();
        ev.free_result(key).unwrap();
        assert!(ev.free_result(key).is_err());
        assert!(!ev.is_result_ready(key));
    }

    #[test]
    fn backprop_keys_are_not_eval_passes() {
        let nn = zeroed(&[1, 1]);
        let mut ev = CpuEvaluator::new();
        let eval = ev.begin_eval(&nn, &[1.]).unwrap();
        let pass = ev.eval_pass(eval).unwrap();
        let bp = ev.begin_backprop(&nn, pass, &[1.]).unwrap();
        assert!(ev.eval_pass(bp).is_err());
    }

    #[test]
    fn compose_with_zero_scalar_is_identity() {
        let mut nn = Network::randomize(&[2, 3, 1], Activation::Sigmoid).unwrap();
        let before: Vec<Vec<Float>> = nn.layers().iter().map(|l| l.weights.clone()).collect();
        let mut ev = CpuEvaluator::new();
        let eval = ev.begin_eval(&nn, &[0.2, 0.8]).unwrap();
        let pass = ev.eval_pass(eval).unwrap();
        let bp = ev.begin_backprop(&nn, pass, &[1.]).unwrap();
        ev.compose_deltas(&mut nn, &[bp], 0., false).unwrap();
        for (layer, weights) in nn.layers().iter().zip(&before) {
            assert_eq!(&layer.weights, weights);
        }
    }
}
