//! neurograph is a neural network training and inference engine with
//! pluggable compute backends.
//!
//! A [`Network`](network::Network) is a stack of fully connected layers. An
//! [`Evaluator`](evaluator::Evaluator) runs forward evaluation,
//! backpropagation, and gradient composition against a network, identified by
//! opaque result keys so that many passes can be in flight at once. Two
//! evaluators are provided: a synchronous CPU reference
//! ([`CpuEvaluator`](cpu::CpuEvaluator)) and an asynchronous gfx-hal based
//! compute evaluator ([`GpuEvaluator`](gpu::GpuEvaluator)). The
//! [`Trainer`](trainer::Trainer) drives an evaluator through training,
//! testing, and evaluation phases over a [`Dataset`](dataset::Dataset).
//!
//! All of the host-side API is single threaded and cooperative: the trainer
//! yields by returning from [`update`](trainer::Trainer::update) whenever a
//! submitted result is not ready yet, and the caller re-enters until
//! [`is_running`](trainer::Trainer::is_running) is false. Parallelism lives
//! on the device side, where multiple command buffers progress concurrently.

pub mod cpu;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod gpu;
pub mod network;
pub mod saved;
pub mod trainer;
mod util;

/// The scalar type used for all network values, samples, and costs.
pub type Float = f32;

/// Convenience alias used throughout the crate.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

pub use cpu::CpuEvaluator;
pub use dataset::{Dataset, DatasetGroup};
pub use evaluator::{choose_evaluator, Evaluator, EvaluatorKind, PassToken, ResultKey};
pub use gpu::GpuEvaluator;
pub use network::{Activation, Layer, Network};
pub use trainer::{Trainer, TrainerSettings};
