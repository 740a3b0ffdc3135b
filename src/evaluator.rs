//! The asynchronous evaluator abstraction.
//!
//! An evaluator accepts forward-evaluation and backpropagation work against a
//! [`Network`] and hands back opaque [`ResultKey`]s. Results become ready
//! asynchronously; the caller polls [`is_result_ready`](Evaluator::is_result_ready)
//! and frees every key it was issued. Many passes may be in flight at once,
//! all sharing the same immutable network values; only
//! [`compose_deltas`](Evaluator::compose_deltas) mutates them.

use crate::{network::Network, Float, Result};
use std::fmt::{self, Display};

/// Opaque identifier for a submitted operation, issued monotonically by an
/// evaluator. A key is only meaningful to the evaluator that issued it and
/// stays valid until [`Evaluator::free_result`] succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultKey(pub(crate) u64);

impl Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A view of one evaluation's pass data, obtained from
/// [`Evaluator::eval_pass`] and consumed by [`Evaluator::begin_backprop`].
///
/// The token names evaluator-owned state; it carries no data itself and is
/// only valid for the evaluator and network that produced it. The backing
/// pass outlives the evaluation key that produced it for as long as any
/// backpropagation result still refers to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassToken {
    pub(crate) pass: u64,
    pub(crate) network: crate::network::NetworkId,
}

/// Pointwise squared-error cost.
pub fn cost(actual: Float, expected: Float) -> Float {
    (actual - expected).powi(2)
}

/// Derivative of [`cost`] with respect to `actual`.
pub fn cost_derivative(actual: Float, expected: Float) -> Float {
    2. * (actual - expected)
}

/// An asynchronous computation engine keyed by opaque result handles.
///
/// All operations fail cleanly on precondition violations: no partial handle
/// is left allocated and accessors on unknown or freed keys return errors
/// rather than crashing. Implementations must drain every in-flight result on
/// drop.
pub trait Evaluator {
    /// Whether the result behind `key` has finished computing. Returns
    /// `false` for unknown keys.
    fn is_result_ready(&self, key: ResultKey) -> bool;

    /// Releases everything committed to `key`: staging allocations, command
    /// buffers, fences, and one reference on the underlying pass. Fails for
    /// unknown keys (including keys already freed) and for results still in
    /// flight.
    fn free_result(&mut self, key: ResultKey) -> Result<()>;

    /// Begins evaluating `nn` over a flat input batch.
    ///
    /// `inputs.len()` must be a positive multiple of `nn.input_count()`; the
    /// quotient is the number of passes evaluated in one submission.
    fn begin_eval(&mut self, nn: &Network, inputs: &[Float]) -> Result<ResultKey>;

    /// The pass behind an evaluation result, suitable for
    /// [`begin_backprop`](Self::begin_backprop). Fails if `key` is unknown or
    /// not an evaluation result.
    fn eval_pass(&self, key: ResultKey) -> Result<PassToken>;

    /// Appends the output-layer activations of every pass in the batch to
    /// `outputs` (`nn.output_count() * run_count` values). Takes `&mut self`
    /// because device backends record a readback submission.
    fn eval_outputs(&mut self, nn: &Network, pass: PassToken, outputs: &mut Vec<Float>)
        -> Result<()>;

    /// Begins backpropagation over every pass of a prior evaluation.
    ///
    /// `expected` is the flattened expected output batch
    /// (`nn.output_count() * run_count` values). The pass must have been
    /// produced by this evaluator for the same network.
    fn begin_backprop(
        &mut self,
        nn: &Network,
        pass: PassToken,
        expected: &[Float],
    ) -> Result<ResultKey>;

    /// Applies `w -= scalar * dw` and `b -= scalar * db`, summed over every
    /// pass referenced by `keys` (all of which must be ready backpropagation
    /// results on `nn`).
    ///
    /// When `copy` is true the canonical CPU-side layer values reflect the
    /// composed result once this returns; backends whose canonical store is
    /// device memory use it to schedule the readback.
    fn compose_deltas(
        &mut self,
        nn: &mut Network,
        keys: &[ResultKey],
        scalar: Float,
        copy: bool,
    ) -> Result<()>;

    /// The pointwise cost this evaluator trains against.
    fn cost_function(&self, actual: Float, expected: Float) -> Float {
        cost(actual, expected)
    }

    /// While training, per-network device resources are pinned so repeated
    /// batches do not re-upload network state as passes drain.
    fn set_training(&mut self, training: bool);

    /// Whether the evaluator is currently in training mode.
    fn is_training(&self) -> bool;
}

/// The backends this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    Cpu,
    Gpu,
}

/// The backend [`choose_evaluator`] reaches for first.
pub fn preferred_evaluator() -> EvaluatorKind {
    EvaluatorKind::Gpu
}

/// Builds an evaluator, preferring the GPU backend when kernels are supplied
/// and a device can be initialized, and falling back to the CPU reference
/// otherwise.
pub fn choose_evaluator(
    preferred: Option<EvaluatorKind>,
    shaders: Option<crate::gpu::shader::ShaderSet>,
) -> Box<dyn Evaluator> {
    let preferred = preferred.unwrap_or_else(preferred_evaluator);
    if preferred == EvaluatorKind::Gpu {
        match shaders {
            Some(shaders) => match crate::gpu::GpuEvaluator::new(shaders) {
                Ok(gpu) => return Box::new(gpu),
                Err(err) => log::warn!("falling back to the CPU evaluator: {err}"),
            },
            None => log::warn!("no kernels supplied, falling back to the CPU evaluator"),
        }
    }
    Box::new(crate::cpu::CpuEvaluator::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squared_error() {
        assert_eq!(cost(0.5, 1.), 0.25);
        assert_eq!(cost(1., 1.), 0.);
        assert_eq!(cost_derivative(0.5, 1.), -1.);
        assert_eq!(cost_derivative(1., 0.5), 1.);
    }

    #[test]
    fn chooses_cpu_without_kernels() {
        let evaluator = choose_evaluator(None, None);
        assert!(!evaluator.is_training());
        assert!(!evaluator.is_result_ready(ResultKey(0)));
    }

    #[test]
    fn cpu_can_be_requested_explicitly() {
        let evaluator = choose_evaluator(Some(EvaluatorKind::Cpu), None);
        assert!(!evaluator.is_result_ready(ResultKey(42)));
    }
}
