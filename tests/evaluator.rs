use approx::assert_relative_eq;
use neurograph::{
    cpu::CpuEvaluator,
    evaluator::Evaluator,
    gpu::{shader::ShaderSet, GpuEvaluator},
    network::{Activation, Layer, Network},
    Float,
};

fn zeroed(sizes: &[usize]) -> Network {
    let layers = sizes
        .windows(2)
        .map(|w| Layer::zeroed(w[1], w[0], Activation::Sigmoid))
        .collect();
    Network::new(layers).unwrap()
}

fn outputs_of(ev: &mut dyn Evaluator, nn: &Network, inputs: &[Float]) -> Vec<Float> {
    let key = ev.begin_eval(nn, inputs).unwrap();
    while !ev.is_result_ready(key) {}
    let pass = ev.eval_pass(key).unwrap();
    let mut outputs = Vec::new();
    ev.eval_outputs(nn, pass, &mut outputs).unwrap();
    ev.free_result(key).unwrap();
    outputs
}

#[test]
fn tiny_identity_check() {
    // Two passes of width 2 through an all-zero [2, 2] network: every output
    // is sigmoid(0).
    let nn = zeroed(&[2, 2]);
    let mut ev = CpuEvaluator::new();
    let outputs = outputs_of(&mut ev, &nn, &[0., 0., 1., 1.]);
    assert_eq!(outputs.len(), 4);
    for x in outputs {
        assert_relative_eq!(x, 0.5, max_relative = 1e-6);
    }
}

#[test]
fn backprop_then_compose_reduces_cost() {
    let mut nn = zeroed(&[1, 1]);
    let mut ev = CpuEvaluator::new();

    let before = outputs_of(&mut ev, &nn, &[1.])[0];
    let cost_before = ev.cost_function(before, 1.);
    assert_relative_eq!(cost_before, 0.25, max_relative = 1e-6);

    let eval = ev.begin_eval(&nn, &[1.]).unwrap();
    let pass = ev.eval_pass(eval).unwrap();
    let backprop = ev.begin_backprop(&nn, pass, &[1.]).unwrap();
    ev.free_result(eval).unwrap();
    ev.compose_deltas(&mut nn, &[backprop], 1., true).unwrap();
    ev.free_result(backprop).unwrap();

    let after = outputs_of(&mut ev, &nn, &[1.])[0];
    let cost_after = ev.cost_function(after, 1.);
    assert!(
        cost_after < cost_before,
        "cost did not decrease: {} -> {}",
        cost_before,
        cost_after
    );
}

#[test]
fn multi_pass_batching_equivalence() {
    let nn = Network::randomize(&[2, 3, 1], Activation::Sigmoid).unwrap();
    let mut ev = CpuEvaluator::new();
    let first = outputs_of(&mut ev, &nn, &[0.1, 0.9]);
    let second = outputs_of(&mut ev, &nn, &[0.7, 0.3]);
    let batched = outputs_of(&mut ev, &nn, &[0.1, 0.9, 0.7, 0.3]);
    assert_eq!(batched.len(), 2);
    assert_relative_eq!(batched[0], first[0], max_relative = 1e-6);
    assert_relative_eq!(batched[1], second[0], max_relative = 1e-6);
}

#[test]
fn refcount_safety() {
    // The eval result can be freed while backprop results still reference
    // its pass; everything drains once the last reference goes.
    let nn = zeroed(&[2, 2]);
    let mut ev = CpuEvaluator::new();
    let eval = ev.begin_eval(&nn, &[0.5, 0.5]).unwrap();
    let pass = ev.eval_pass(eval).unwrap();
    let b1 = ev.begin_backprop(&nn, pass, &[1., 0.]).unwrap();
    let b2 = ev.begin_backprop(&nn, pass, &[0., 1.]).unwrap();
    ev.free_result(eval).unwrap();
    ev.free_result(b1).unwrap();
    ev.free_result(b2).unwrap();
    assert_eq!(ev.outstanding_results(), 0);
    assert!(ev.free_result(b2).is_err());
}

#[test]
fn shape_mismatch_rejected() {
    let nn = zeroed(&[2, 1]);
    let mut ev = CpuEvaluator::new();
    let good = ev.begin_eval(&nn, &[0., 1.]).unwrap();
    assert!(ev.begin_eval(&nn, &[0., 1., 0.5]).is_err());
    assert!(ev.begin_eval(&nn, &[]).is_err());
    // The failed submissions allocated nothing.
    assert_eq!(ev.outstanding_results(), 1);
    ev.free_result(good).unwrap();
    assert!(!ev.is_result_ready(good));
}

#[test]
fn output_length_matches_run_count() {
    let nn = Network::randomize(&[3, 5, 2], Activation::Sigmoid).unwrap();
    let mut ev = CpuEvaluator::new();
    for run_count in 1..5 {
        let inputs = vec![0.25; 3 * run_count];
        let outputs = outputs_of(&mut ev, &nn, &inputs);
        assert_eq!(outputs.len(), 2 * run_count);
    }
}

#[test]
fn composing_together_equals_separately() {
    let template: Vec<Layer> = Network::randomize(&[2, 3, 2], Activation::Sigmoid)
        .unwrap()
        .layers()
        .to_vec();
    let mut together = Network::new(template.clone()).unwrap();
    let mut separately = Network::new(template).unwrap();
    let samples: [(&[Float], &[Float]); 2] = [(&[0.2, 0.8], &[1., 0.]), (&[0.9, 0.1], &[0., 1.])];
    let scalar = 0.5;

    let mut ev = CpuEvaluator::new();
    let mut keys = Vec::new();
    for (inputs, expected) in samples {
        let eval = ev.begin_eval(&together, inputs).unwrap();
        let pass = ev.eval_pass(eval).unwrap();
        keys.push(ev.begin_backprop(&together, pass, expected).unwrap());
        ev.free_result(eval).unwrap();
    }
    ev.compose_deltas(&mut together, &keys, scalar, true).unwrap();
    for key in keys {
        ev.free_result(key).unwrap();
    }

    let mut ev = CpuEvaluator::new();
    for (inputs, expected) in samples {
        let eval = ev.begin_eval(&separately, inputs).unwrap();
        let pass = ev.eval_pass(eval).unwrap();
        let backprop = ev.begin_backprop(&separately, pass, expected).unwrap();
        ev.free_result(eval).unwrap();
        ev.compose_deltas(&mut separately, &[backprop], scalar, true)
            .unwrap();
        ev.free_result(backprop).unwrap();
    }

    for (a, b) in together.layers().iter().zip(separately.layers()) {
        for (x, y) in a.biases.iter().zip(&b.biases) {
            assert_relative_eq!(*x, *y, max_relative = 1e-5);
        }
        for (x, y) in a.weights.iter().zip(&b.weights) {
            assert_relative_eq!(*x, *y, max_relative = 1e-5);
        }
    }
}

fn total_cost(ev: &mut CpuEvaluator, layers: &[Layer], inputs: &[Float], expected: &[Float]) -> Float {
    let nn = Network::new(layers.to_vec()).unwrap();
    let outputs = outputs_of(ev, &nn, inputs);
    outputs
        .iter()
        .zip(expected)
        .map(|(a, y)| ev.cost_function(*a, *y))
        .sum()
}

#[test]
fn backprop_matches_finite_differences() {
    // The gradient applied by compose_deltas is recovered as
    // (w_before - w_after) / scalar and checked against a central-difference
    // estimate of dC/dw for every parameter.
    let inputs: &[Float] = &[0.3, 0.7];
    let expected: &[Float] = &[1., 0.];
    let scalar = 0.25;
    let step = 1e-2;

    let template: Vec<Layer> = Network::randomize(&[2, 3, 2], Activation::Sigmoid)
        .unwrap()
        .layers()
        .to_vec();
    let mut ev = CpuEvaluator::new();

    let mut nn = Network::new(template.clone()).unwrap();
    let eval = ev.begin_eval(&nn, inputs).unwrap();
    let pass = ev.eval_pass(eval).unwrap();
    let backprop = ev.begin_backprop(&nn, pass, expected).unwrap();
    ev.free_result(eval).unwrap();
    ev.compose_deltas(&mut nn, &[backprop], scalar, true).unwrap();
    ev.free_result(backprop).unwrap();

    for layer_index in 0..template.len() {
        let parameter_count = template[layer_index].biases.len() + template[layer_index].weights.len();
        for parameter in 0..parameter_count {
            let value_of = |layers: &[Layer]| {
                let layer = &layers[layer_index];
                if parameter < layer.biases.len() {
                    layer.biases[parameter]
                } else {
                    layer.weights[parameter - layer.biases.len()]
                }
            };
            let perturbed = |delta: Float| {
                let mut layers = template.clone();
                let layer = &mut layers[layer_index];
                if parameter < layer.biases.len() {
                    layer.biases[parameter] += delta;
                } else {
                    layer.weights[parameter - layer.biases.len()] += delta;
                }
                layers
            };
            let analytic = (value_of(&template) - value_of(nn.layers())) / scalar;
            let numeric = (total_cost(&mut ev, &perturbed(step), inputs, expected)
                - total_cost(&mut ev, &perturbed(-step), inputs, expected))
                / (2. * step);
            assert!(
                (analytic - numeric).abs() <= 1e-3 + 1e-2 * numeric.abs(),
                "layer {layer_index} parameter {parameter}: analytic {analytic} vs numeric {numeric}"
            );
        }
    }
}

/// Compares the GPU backend against the CPU reference. Skips when no
/// compiled kernels or no compute device are available.
#[test]
fn cpu_gpu_equivalence() {
    let shader_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/bin");
    let shaders = match ShaderSet::load_dir(shader_dir) {
        Ok(shaders) => shaders,
        Err(_) => {
            eprintln!("skipping cpu_gpu_equivalence: no compiled shaders in {shader_dir}");
            return;
        }
    };
    let mut gpu = match GpuEvaluator::new(shaders) {
        Ok(gpu) => gpu,
        Err(err) => {
            eprintln!("skipping cpu_gpu_equivalence: {err}");
            return;
        }
    };
    let mut cpu = CpuEvaluator::new();
    let nn = Network::randomize(&[4, 6, 3], Activation::Sigmoid).unwrap();
    let inputs: Vec<Float> = (0..8).map(|i| i as Float / 8.).collect();
    let expected = outputs_of(&mut cpu, &nn, &inputs);
    let actual = outputs_of(&mut gpu, &nn, &inputs);
    assert_eq!(expected.len(), actual.len());
    for (a, b) in actual.iter().zip(&expected) {
        assert_relative_eq!(*a, *b, max_relative = 1e-5);
    }
    assert_eq!(gpu.outstanding_passes(), 0);
    assert_eq!(gpu.outstanding_results(), 0);
}
