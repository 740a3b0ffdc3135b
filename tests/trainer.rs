use neurograph::{
    cpu::CpuEvaluator,
    dataset::{DatasetGroup, SliceDataset},
    evaluator::{Evaluator, PassToken, ResultKey},
    network::{Activation, Layer, Network},
    trainer::{Trainer, TrainerSettings},
    Float, Result,
};
use std::{cell::Cell, rc::Rc};

fn zeroed(sizes: &[usize]) -> Network {
    let layers = sizes
        .windows(2)
        .map(|w| Layer::zeroed(w[1], w[0], Activation::Sigmoid))
        .collect();
    Network::new(layers).unwrap()
}

#[test]
fn terminates_without_training_when_threshold_met() {
    // An all-zero network answers 0.5 everywhere; a testing group that
    // expects exactly that passes the threshold on the opening testing pass,
    // so the training phase never runs.
    let mut nn = zeroed(&[2, 2]);
    let mut ev = CpuEvaluator::new();
    let mut set = SliceDataset::new(2, 2);
    for i in 0..4 {
        let x = i as Float / 4.;
        set.push(DatasetGroup::Training, vec![x, 1. - x], vec![1., 0.]);
        set.push(DatasetGroup::Testing, vec![x, x], vec![0.5, 0.5]);
    }
    let settings = TrainerSettings {
        batch_size: 2,
        eval_batch_size: 3,
        learning_rate: 1.,
        minimum_average_cost: 0.01,
    };
    let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings).unwrap();
    trainer.start().unwrap();
    let mut iterations = 0;
    while trainer.is_running() {
        assert_ne!(
            trainer.phase(),
            DatasetGroup::Training,
            "trainer entered the training phase"
        );
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 10_000, "trainer failed to terminate");
    }
}

#[test]
fn evaluation_group_runs_after_testing_passes() {
    let mut nn = zeroed(&[1, 1]);
    let mut ev = CpuEvaluator::new();
    let mut set = SliceDataset::new(1, 1);
    for _ in 0..2 {
        set.push(DatasetGroup::Training, vec![1.], vec![0.5]);
        set.push(DatasetGroup::Testing, vec![0.], vec![0.5]);
        set.push(DatasetGroup::Evaluation, vec![1.], vec![0.5]);
    }
    let settings = TrainerSettings {
        batch_size: 1,
        eval_batch_size: 1,
        learning_rate: 1.,
        minimum_average_cost: 0.01,
    };
    let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings).unwrap();
    trainer.start().unwrap();
    let mut saw_evaluation = false;
    let mut iterations = 0;
    while trainer.is_running() {
        saw_evaluation |= trainer.phase() == DatasetGroup::Evaluation;
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 10_000, "trainer failed to terminate");
    }
    assert!(saw_evaluation);
}

#[test]
fn cost_callbacks_observe_every_verdict() {
    let observed = Cell::new(0usize);
    let mut nn = zeroed(&[2, 2]);
    let mut ev = CpuEvaluator::new();
    let mut set = SliceDataset::new(2, 2);
    set.push(DatasetGroup::Training, vec![0., 1.], vec![0.5, 0.5]);
    set.push(DatasetGroup::Training, vec![1., 0.], vec![0.5, 0.5]);
    set.push(DatasetGroup::Testing, vec![0., 0.], vec![0.5, 0.5]);
    let settings = TrainerSettings {
        batch_size: 1,
        eval_batch_size: 1,
        learning_rate: 1.,
        minimum_average_cost: 0.01,
    };
    let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings).unwrap();
    trainer.on_eval_batch_complete(|cost| {
        assert!(cost >= 0.);
        observed.set(observed.get() + 1);
    });
    trainer.start().unwrap();
    let mut iterations = 0;
    while trainer.is_running() {
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 10_000);
    }
    drop(trainer);
    assert_eq!(observed.get(), 1, "the opening testing pass reports one cost");
}

#[test]
fn training_converges_on_constant_target() {
    // A [1, 1] network learning to answer 1.0: a few dozen epochs of plain
    // gradient descent push the output past the cost threshold.
    let mut nn = zeroed(&[1, 1]);
    let mut ev = CpuEvaluator::new();
    let mut set = SliceDataset::new(1, 1);
    for _ in 0..8 {
        set.push(DatasetGroup::Training, vec![1.], vec![1.]);
    }
    set.push(DatasetGroup::Testing, vec![1.], vec![1.]);
    set.push(DatasetGroup::Testing, vec![1.], vec![1.]);
    let settings = TrainerSettings {
        batch_size: 2,
        eval_batch_size: 2,
        learning_rate: 3.,
        minimum_average_cost: 0.05,
    };
    let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings).unwrap();
    trainer.start().unwrap();
    let mut iterations = 0;
    while trainer.is_running() {
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 500_000, "training failed to converge");
    }
    drop(trainer);
    assert_eq!(ev.outstanding_results(), 0);
}

/// Counts batched submissions on the way through to the reference evaluator.
/// The count lives behind a shared cell because the trainer holds the
/// evaluator exclusively while it runs.
struct CountingEvaluator {
    inner: CpuEvaluator,
    evals: Rc<Cell<usize>>,
}

impl Evaluator for CountingEvaluator {
    fn is_result_ready(&self, key: ResultKey) -> bool {
        self.inner.is_result_ready(key)
    }
    fn free_result(&mut self, key: ResultKey) -> Result<()> {
        self.inner.free_result(key)
    }
    fn begin_eval(&mut self, nn: &Network, inputs: &[Float]) -> Result<ResultKey> {
        self.evals.set(self.evals.get() + 1);
        self.inner.begin_eval(nn, inputs)
    }
    fn eval_pass(&self, key: ResultKey) -> Result<PassToken> {
        self.inner.eval_pass(key)
    }
    fn eval_outputs(&mut self, nn: &Network, pass: PassToken, outputs: &mut Vec<Float>) -> Result<()> {
        self.inner.eval_outputs(nn, pass, outputs)
    }
    fn begin_backprop(&mut self, nn: &Network, pass: PassToken, expected: &[Float]) -> Result<ResultKey> {
        self.inner.begin_backprop(nn, pass, expected)
    }
    fn compose_deltas(
        &mut self,
        nn: &mut Network,
        keys: &[ResultKey],
        scalar: Float,
        copy: bool,
    ) -> Result<()> {
        self.inner.compose_deltas(nn, keys, scalar, copy)
    }
    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training)
    }
    fn is_training(&self) -> bool {
        self.inner.is_training()
    }
}

#[test]
fn one_epoch_submits_batch_count_batches() {
    let evals = Rc::new(Cell::new(0));
    let mut nn = zeroed(&[1, 1]);
    let mut ev = CountingEvaluator {
        inner: CpuEvaluator::new(),
        evals: evals.clone(),
    };
    let mut set = SliceDataset::new(1, 1);
    for i in 0..10 {
        set.push(DatasetGroup::Training, vec![i as Float / 10.], vec![1.]);
    }
    set.push(DatasetGroup::Testing, vec![0.], vec![1.]);
    let settings = TrainerSettings {
        batch_size: 3,
        eval_batch_size: 1,
        // Unreachable threshold, so testing always falls through to training.
        minimum_average_cost: 1e-9,
        learning_rate: 0.1,
    };
    let mut trainer = Trainer::new(&mut nn, &mut ev, &set, settings).unwrap();
    trainer.start().unwrap();
    assert_eq!(trainer.batch_count(), 3);

    // Run the opening testing phase to its verdict.
    let mut iterations = 0;
    while trainer.phase() != DatasetGroup::Training {
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 10_000);
    }
    let evals_before_epoch = evals.get();
    // Run the full training epoch.
    while trainer.phase() == DatasetGroup::Training {
        trainer.update().unwrap();
        iterations += 1;
        assert!(iterations < 10_000);
    }
    let epoch_evals = evals.get() - evals_before_epoch;
    assert_eq!(epoch_evals, 3, "one epoch must submit exactly batch_count batches");
    trainer.stop();
}
