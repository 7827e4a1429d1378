pub use adam::Adam;
pub mod adam;

pub use gradient_descent::GradientDescent;
pub mod gradient_descent;

use crate::{
    device::{Buffer, Context},
    error::DeviceError,
    helpers::zero,
};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// Optimization algorithms only hold their hyperparameters. Any state they
/// carry between updates lives in a flat buffer owned by the engine, sized by
/// [state_size](Optimizer::state_size).
#[enum_dispatch]
pub trait Optimizer {
    /// Length of the state buffer needed for `parameter_count` parameters.
    fn state_size(&self, parameter_count: usize) -> usize;

    /// Fill a freshly allocated state buffer.
    fn init(&self, state: &mut [f32]);

    /// Called once per batch, before any derivatives are accumulated.
    fn begin_batch(&self, derivatives: &mut [f32]) {
        zero(derivatives);
    }

    /// Apply one optimization step using the derivatives accumulated over a batch of `batch_size` examples.
    fn update(&self, params: &mut [f32], derivatives: &[f32], state: &mut [f32], batch_size: usize);
}

/// Device counterpart of [Optimizer], operating on buffers with the same layout.
#[enum_dispatch]
pub trait DeviceOptimizer: Optimizer {
    fn enqueue_begin_batch(&self, context: &mut Context, derivatives: Buffer<f32>) {
        context.enqueue_fill(derivatives, 0.);
    }

    fn enqueue_update(
        &self,
        context: &mut Context,
        params: Buffer<f32>,
        derivatives: Buffer<f32>,
        state: Buffer<f32>,
        batch_size: usize,
    ) -> Result<(), DeviceError>;
}

#[enum_dispatch(Optimizer)]
#[enum_dispatch(DeviceOptimizer)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BasicOptimizer {
    GradientDescent(GradientDescent),
    Adam(Adam),
}

/// Step size shared by every parameter of one update.
pub(crate) fn step_scale(learning_rate: f32, batch_size: usize) -> f32 {
    learning_rate / batch_size as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{tests::check, BackPropData, DenseLayer, Layer};
    use proptest::prelude::*;

    fn accumulate(layer: &DenseLayer, params: &[f32], example: &(Vec<f32>, Vec<f32>), derivatives: &mut [f32]) {
        let output = vec![0.; layer.output_size()];
        let data = BackPropData {
            input: &example.0,
            output: &output,
            output_error: &example.1,
            params,
        };
        layer.calculate_derivatives(&data, derivatives);
    }

    proptest! {
        #[test]
        fn batch_accumulation_matches_summed_gradients(
            examples in prop::collection::vec(
                (prop::collection::vec(-1f32..1., 3), prop::collection::vec(-1f32..1., 2)),
                1..8,
            ),
            params in prop::collection::vec(-1f32..1., 8),
        ) {
            let layer = DenseLayer::new(3, 2).unwrap();
            let optimizer = BasicOptimizer::from(GradientDescent::new(0.1));

            let mut batched = params.clone();
            let mut derivatives = vec![1.; params.len()];
            optimizer.begin_batch(&mut derivatives);
            for example in &examples {
                accumulate(&layer, &params, example, &mut derivatives);
            }
            optimizer.update(&mut batched, &derivatives, &mut [], examples.len());

            let mut summed = vec![0.; params.len()];
            for example in &examples {
                let mut single = vec![0.; params.len()];
                accumulate(&layer, &params, example, &mut single);
                for (s, g) in summed.iter_mut().zip(&single) {
                    *s += g;
                }
            }
            let mut expected = params.clone();
            optimizer.update(&mut expected, &summed, &mut [], examples.len());

            check(&expected, &batched, 1e-5, "parameters");
        }
    }
}
