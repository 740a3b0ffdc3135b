//! The training orchestrator.
//!
//! A [`Trainer`] borrows a network, an evaluator, and a dataset, and drives
//! supervised training through a phase machine: the testing phase runs first,
//! and whenever the average per-output cost on the testing group is still
//! above the threshold, a full epoch of training batches runs before testing
//! again. Inside the training phase a stage machine cycles
//! eval → backprop → deltas, advancing one stage per readiness transition so
//! the caller can interleave other work while the evaluator grinds.

use crate::{
    dataset::{Dataset, DatasetGroup},
    error::EvaluatorError,
    evaluator::{Evaluator, ResultKey},
    network::Network,
    util, Float, Result,
};
use anyhow::{anyhow, ensure};
use rand::Rng;
use std::collections::HashMap;

/// Training configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerSettings {
    /// Samples per training batch.
    pub batch_size: usize,
    /// Samples per testing/evaluation submission.
    pub eval_batch_size: usize,
    pub learning_rate: Float,
    /// Testing-phase average cost below which training stops.
    pub minimum_average_cost: Float,
}

/// Stage of the training-phase pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrainingStage {
    Eval,
    Backprop,
    Deltas,
}

/// Drives an [`Evaluator`] over a [`Dataset`] until the testing cost drops
/// below the configured threshold.
pub struct Trainer<'a> {
    network: &'a mut Network,
    evaluator: &'a mut dyn Evaluator,
    dataset: &'a dyn Dataset,
    settings: TrainerSettings,
    current: TrainerSettings,
    batch_count: usize,
    current_batch: usize,
    current_eval_index: usize,
    current_eval_batch: usize,
    running: bool,
    eval_costs: Vec<Float>,
    sample_map: HashMap<ResultKey, Vec<Float>>,
    training_cycle: Vec<usize>,
    phase: DatasetGroup,
    stage: TrainingStage,
    current_keys: Vec<ResultKey>,
    cost_callbacks: Vec<Box<dyn FnMut(Float) + 'a>>,
}

impl<'a> Trainer<'a> {
    /// Puts `evaluator` into training mode for the lifetime of the trainer.
    /// Fails if it already is.
    pub fn new(
        network: &'a mut Network,
        evaluator: &'a mut dyn Evaluator,
        dataset: &'a dyn Dataset,
        settings: TrainerSettings,
    ) -> Result<Self> {
        ensure!(!evaluator.is_training(), EvaluatorError::AlreadyTraining);
        evaluator.set_training(true);
        Ok(Self {
            network,
            evaluator,
            dataset,
            settings,
            current: settings,
            batch_count: 0,
            current_batch: 0,
            current_eval_index: 0,
            current_eval_batch: 0,
            running: false,
            eval_costs: Vec::new(),
            sample_map: HashMap::new(),
            training_cycle: Vec::new(),
            phase: DatasetGroup::Testing,
            stage: TrainingStage::Eval,
            current_keys: Vec::new(),
            cost_callbacks: Vec::new(),
        })
    }

    /// Registers a callback invoked with every testing/evaluation phase's
    /// average cost, before the threshold decision is made.
    pub fn on_eval_batch_complete(&mut self, callback: impl FnMut(Float) + 'a) {
        self.cost_callbacks.push(Box::new(callback));
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Settings changes apply at the next [`start`](Self::start).
    pub fn settings_mut(&mut self) -> &mut TrainerSettings {
        &mut self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn phase(&self) -> DatasetGroup {
        self.phase
    }

    /// Training batches per epoch.
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// The shuffled sample order for the current epoch.
    pub fn training_cycle(&self) -> &[usize] {
        &self.training_cycle
    }

    /// Validates the dataset, snapshots the settings, and opens with a
    /// testing pass; a dataset that already meets the cost threshold never
    /// trains at all.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        ensure!(
            self.dataset.has_group(DatasetGroup::Training),
            EvaluatorError::MissingGroup("training")
        );
        ensure!(
            self.dataset.has_group(DatasetGroup::Testing),
            EvaluatorError::MissingGroup("testing")
        );
        ensure!(
            self.settings.batch_size > 0 && self.settings.eval_batch_size > 0,
            "batch sizes must be positive"
        );
        let training_samples = self.dataset.sample_count(DatasetGroup::Training);
        let batch_count = training_samples / self.settings.batch_size;
        ensure!(
            batch_count > 0,
            "training group has {} samples, fewer than one batch of {}",
            training_samples,
            self.settings.batch_size
        );
        self.phase = DatasetGroup::Testing;
        self.stage = TrainingStage::Eval;
        self.current = self.settings;
        self.current_eval_index = 0;
        self.current_eval_batch = 0;
        self.batch_count = batch_count;
        self.eval_costs.clear();
        self.running = true;
        self.regenerate_training_cycle();
        log::info!(
            "beginning training: {} batches of {} per epoch",
            self.batch_count,
            self.current.batch_size
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        log::info!("stopping training");
        self.running = false;
    }

    /// Advances the state machine by at most one readiness transition. Any
    /// evaluator or dataset failure is fatal: the error propagates and the
    /// trainer stops.
    pub fn update(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        let update = self.update_inner();
        if update.is_err() {
            self.running = false;
        }
        update
    }

    fn update_inner(&mut self) -> Result<()> {
        match self.phase {
            DatasetGroup::Training => {
                if self.do_training_cycle()? {
                    self.phase = DatasetGroup::Testing;
                    self.current_eval_index = 0;
                }
            }
            _ => {
                if self.do_eval()? {
                    if let Some(cost) = self.take_average_cost() {
                        log::info!("{} average cost: {}", self.phase.name(), cost);
                        for callback in self.cost_callbacks.iter_mut() {
                            callback(cost);
                        }
                        if cost < self.current.minimum_average_cost {
                            match self.phase {
                                DatasetGroup::Testing
                                    if self.dataset.has_group(DatasetGroup::Evaluation) =>
                                {
                                    self.phase = DatasetGroup::Evaluation;
                                    self.current_eval_index = 0;
                                }
                                _ => self.stop(),
                            }
                        } else {
                            self.phase = DatasetGroup::Training;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Mean absolute accumulated cost, draining the accumulator. `None` when
    /// nothing was accumulated.
    fn take_average_cost(&mut self) -> Option<Float> {
        if self.eval_costs.is_empty() {
            return None;
        }
        let costs = std::mem::take(&mut self.eval_costs);
        let sum: Float = costs.iter().map(|cost| cost.abs()).sum();
        Some(sum / costs.len() as Float)
    }

    /// Resets the batch cursor and reshuffles the training permutation with a
    /// Fisher-Yates pass over the shared generator.
    fn regenerate_training_cycle(&mut self) {
        self.current_batch = 0;
        let count = self.dataset.sample_count(DatasetGroup::Training);
        self.training_cycle = (0..count).collect();
        util::with_rng(|rng| {
            for n in (1..count).rev() {
                let i = rng.gen_range(0..=n);
                self.training_cycle.swap(i, n);
            }
        });
    }

    /// One training-stage pump. Returns true when the epoch just finished.
    fn do_training_cycle(&mut self) -> Result<bool> {
        loop {
            if self
                .current_keys
                .iter()
                .any(|key| !self.evaluator.is_result_ready(*key))
            {
                return Ok(false);
            }
            if !self.current_keys.is_empty() {
                self.stage = match self.stage {
                    TrainingStage::Eval => TrainingStage::Backprop,
                    TrainingStage::Backprop => TrainingStage::Deltas,
                    TrainingStage::Deltas => TrainingStage::Deltas,
                };
            }
            match self.stage {
                TrainingStage::Eval => self.eval()?,
                TrainingStage::Backprop => self.backprop()?,
                TrainingStage::Deltas => {
                    // Delta composition completes synchronously, so the stage
                    // machine can wrap around immediately.
                    self.stage = TrainingStage::Eval;
                    if self.compose_deltas()? {
                        self.regenerate_training_cycle();
                        return Ok(true);
                    }
                    return Ok(false);
                }
            }
        }
    }

    /// Submits one training batch drawn from the shuffled cycle.
    fn eval(&mut self) -> Result<()> {
        let batch_size = self.current.batch_size;
        let input_count = self.dataset.input_count();
        let output_count = self.dataset.output_count();
        let mut batch_inputs = Vec::with_capacity(batch_size * input_count);
        let mut batch_outputs = Vec::with_capacity(batch_size * output_count);
        for i in 0..batch_size {
            let cycle_index = i + self.current_batch * batch_size;
            let sample_index = self.training_cycle[cycle_index];
            let (inputs, outputs) = self
                .dataset
                .get_sample(DatasetGroup::Training, sample_index)
                .ok_or_else(|| anyhow!("failed to retrieve training sample {}", sample_index))?;
            batch_inputs.extend(inputs);
            batch_outputs.extend(outputs);
        }
        let key = self.evaluator.begin_eval(self.network, &batch_inputs)?;
        self.sample_map.insert(key, batch_outputs);
        self.current_keys.push(key);
        Ok(())
    }

    /// Threads every ready evaluation into a backpropagation request, freeing
    /// the evaluation keys as they are consumed.
    fn backprop(&mut self) -> Result<()> {
        if self.current_keys.is_empty() {
            return Ok(());
        }
        let eval_keys = std::mem::take(&mut self.current_keys);
        for eval_key in eval_keys {
            let expected = self
                .sample_map
                .remove(&eval_key)
                .ok_or_else(|| anyhow!("missing expected outputs for a submitted batch"))?;
            let pass = self.evaluator.eval_pass(eval_key)?;
            let key = self.evaluator.begin_backprop(self.network, pass, &expected)?;
            self.evaluator.free_result(eval_key)?;
            self.current_keys.push(key);
        }
        Ok(())
    }

    /// Applies the accumulated gradients. Returns true at the end of the
    /// epoch, which is also when the canonical layer values are synced back.
    fn compose_deltas(&mut self) -> Result<bool> {
        self.current_batch += 1;
        let is_last_batch = self.current_batch == self.batch_count;
        let scalar = self.current.learning_rate / self.current.batch_size as Float;
        let keys = std::mem::take(&mut self.current_keys);
        self.evaluator
            .compose_deltas(self.network, &keys, scalar, is_last_batch)?;
        for key in keys {
            self.evaluator.free_result(key)?;
        }
        Ok(is_last_batch)
    }

    /// One testing/evaluation pump. Returns true when the whole group has
    /// been scored.
    fn do_eval(&mut self) -> Result<bool> {
        let sample_count = self.dataset.sample_count(self.phase);
        if !self.current_keys.is_empty() {
            if self
                .current_keys
                .iter()
                .any(|key| !self.evaluator.is_result_ready(*key))
            {
                return Ok(false);
            }
            self.collect_eval_costs()?;
            self.current_eval_index += self.current_eval_batch;
            self.current_eval_batch = 0;
        }
        if self.current_eval_index >= sample_count {
            return Ok(true);
        }
        let batch_size = (sample_count - self.current_eval_index).min(self.current.eval_batch_size);
        let mut batch_inputs = Vec::with_capacity(batch_size * self.dataset.input_count());
        let mut batch_outputs = Vec::with_capacity(batch_size * self.dataset.output_count());
        for i in 0..batch_size {
            let sample_index = self.current_eval_index + i;
            let (inputs, outputs) = self
                .dataset
                .get_sample(self.phase, sample_index)
                .ok_or_else(|| {
                    anyhow!(
                        "failed to retrieve {} sample {}",
                        self.phase.name(),
                        sample_index
                    )
                })?;
            batch_inputs.extend(inputs);
            batch_outputs.extend(outputs);
        }
        let key = self.evaluator.begin_eval(self.network, &batch_inputs)?;
        self.sample_map.insert(key, batch_outputs);
        self.current_keys.push(key);
        self.current_eval_batch = batch_size;
        Ok(false)
    }

    /// Scores every ready key against its expected outputs with the
    /// evaluator's own cost function.
    fn collect_eval_costs(&mut self) -> Result<()> {
        let keys = std::mem::take(&mut self.current_keys);
        for key in keys {
            let expected = self
                .sample_map
                .remove(&key)
                .ok_or_else(|| anyhow!("missing expected outputs for a submitted batch"))?;
            let pass = self.evaluator.eval_pass(key)?;
            let mut outputs = Vec::new();
            self.evaluator.eval_outputs(self.network, pass, &mut outputs)?;
            ensure!(
                outputs.len() == expected.len(),
                "evaluator returned {} outputs for {} expected values",
                outputs.len(),
                expected.len()
            );
            for (actual, expected) in outputs.iter().zip(&expected) {
                self.eval_costs
                    .push(self.evaluator.cost_function(*actual, *expected));
            }
            self.evaluator.free_result(key)?;
        }
        Ok(())
    }
}

impl Drop for Trainer<'_> {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
        // Free whatever is already finished; anything still in flight is
        // drained by the evaluator's own teardown.
        for key in std::mem::take(&mut self.current_keys) {
            if self.evaluator.is_result_ready(key) {
                let _ = self.evaluator.free_result(key);
            }
        }
        self.evaluator.set_training(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::CpuEvaluator,
        dataset::SliceDataset,
        network::{Activation, Layer},
    };

    fn xor_like_dataset(samples: usize) -> SliceDataset {
        let mut set = SliceDataset::new(2, 1);
        for i in 0..samples {
            let a = (i % 2) as Float;
            let b = ((i / 2) % 2) as Float;
            set.push(DatasetGroup::Training, vec![a, b], vec![a.max(b)]);
        }
        set.push(DatasetGroup::Testing, vec![0., 0.], vec![0.]);
        set.push(DatasetGroup::Testing, vec![1., 1.], vec![1.]);
        set
    }

    fn settings() -> TrainerSettings {
        TrainerSettings {
            batch_size: 2,
            eval_batch_size: 2,
            learning_rate: 0.5,
            minimum_average_cost: 0.05,
        }
    }

    #[test]
    fn requires_training_and_testing_groups() {
        let mut nn = Network::randomize(&[2, 2, 1], Activation::Sigmoid).unwrap();
        let mut ev = CpuEvaluator::new();
        let mut incomplete = SliceDataset::new(2, 1);
        incomplete.push(DatasetGroup::Training, vec![0., 0.], vec![0.]);
        let mut trainer = Trainer::new(&mut nn, &mut ev, &incomplete, settings()).unwrap();
        assert!(trainer.start().is_err());
        assert!(!trainer.is_running());
    }

    #[test]
    fn refuses_evaluator_already_training() {
        let mut nn = Network::randomize(&[2, 1], Activation::Sigmoid).unwrap();
        let mut ev = CpuEvaluator::new();
        ev.set_training(true);
        let set = xor_like_dataset(4);
        assert!(Trainer::new(&mut nn, &mut ev, &set, settings()).is_err());
    }

    #[test]
    fn training_mode_spans_trainer_lifetime() {
        let mut nn = Network::randomize(&[2, 1], Activation::Sigmoid).unwrap();
        let mut ev = CpuEvaluator::new();
        let set = xor_like_dataset(4);
        {
            let _trainer = Trainer::new(&mut nn, &mut ev, &set, settings()).unwrap();
        }
        assert!(!ev.is_training());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut nn = Network::randomize(&[2, 1], Activation::Sigmoid).unwrap();
        let mut ev = CpuEvaluator::new();
        let set = xor_like_dataset(16);
        let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings()).unwrap();
        trainer.start().unwrap();
        let mut cycle = trainer.training_cycle().to_vec();
        assert_eq!(cycle.len(), 16);
        cycle.sort_unstable();
        assert_eq!(cycle, (0..16).collect::<Vec<_>>());
    }
}
