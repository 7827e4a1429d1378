#![allow(dead_code)]

use accel_nn::Tensor;
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// `count` samples drawn uniformly from `[low, high)`.
pub fn uniform(count: usize, low: f32, high: f32, seed: u64) -> Vec<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(low, high)).collect()
}

/// One dimensional regression data, inputs shaped `[count, 1]`.
pub fn regression<F: Fn(f32) -> f32>(f: F, count: usize, seed: u64) -> (Tensor<'static>, Tensor<'static>) {
    let xs = uniform(count, -1., 1., seed);
    let ys = xs.iter().map(|x| f(*x)).collect();
    (
        Tensor::new([count, 1], xs).unwrap(),
        Tensor::new([count, 1], ys).unwrap(),
    )
}

pub fn check(expected: &[f32], output: &[f32], tolerance: f32, id: &str) {
    assert_eq!(expected.len(), output.len(), "{} differ in length", id);
    for (i, (e, o)) in expected.iter().zip(output).enumerate() {
        assert!(
            (e - o).abs() < tolerance,
            "Evaluation produced incorrect {} at {}.\nexpected: {:?}\nreceived: {:?}",
            id,
            i,
            expected,
            output
        );
    }
}
