use crate::device::{Buffer, Context, Kernel};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

#[enum_dispatch]
pub trait LossFunc {
    /// Elementwise error between `output` and `target`.
    fn calculate_error(&self, output: &[f32], target: &[f32], error: &mut [f32]);

    /// Aggregate error of one example.
    fn total_error(&self, output: &[f32], target: &[f32]) -> f32;

    /// Derivative of the error with respect to every output.
    fn calculate_derivatives(&self, output: &[f32], target: &[f32], derivatives: &mut [f32]);
}

#[enum_dispatch]
pub trait DeviceLoss: LossFunc {
    fn enqueue_derivatives(
        &self,
        context: &mut Context,
        output: Buffer<f32>,
        target: Buffer<f32>,
        derivatives: Buffer<f32>,
    );

    /// Writes one aggregate error per example into `errors`.
    fn enqueue_total_error(
        &self,
        context: &mut Context,
        output: Buffer<f32>,
        target: Buffer<f32>,
        errors: Buffer<f32>,
        size: usize,
    );
}

#[enum_dispatch(LossFunc)]
#[enum_dispatch(DeviceLoss)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Loss {
    MeanSquared(MeanSquared),
}

/// Squared difference per element. The aggregate is the plain sum, it is not
/// divided by the output size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanSquared;

fn check_lengths(output: &[f32], target: &[f32]) {
    assert_eq!(
        output.len(),
        target.len(),
        "Value vector must be the same length as target vector. val: {}, target: {}",
        output.len(),
        target.len()
    );
}

impl LossFunc for MeanSquared {
    fn calculate_error(&self, output: &[f32], target: &[f32], error: &mut [f32]) {
        check_lengths(output, target);
        for ((e, o), t) in error.iter_mut().zip(output).zip(target) {
            let diff = o - t;
            *e = diff * diff;
        }
    }

    fn total_error(&self, output: &[f32], target: &[f32]) -> f32 {
        check_lengths(output, target);
        let mut sum = 0.;
        for (o, t) in output.iter().zip(target) {
            let diff = o - t;
            sum += diff * diff;
        }
        sum
    }

    fn calculate_derivatives(&self, output: &[f32], target: &[f32], derivatives: &mut [f32]) {
        check_lengths(output, target);
        for ((d, o), t) in derivatives.iter_mut().zip(output).zip(target) {
            *d = 2. * (o - t);
        }
    }
}

impl DeviceLoss for MeanSquared {
    fn enqueue_derivatives(
        &self,
        context: &mut Context,
        output: Buffer<f32>,
        target: Buffer<f32>,
        derivatives: Buffer<f32>,
    ) {
        context.enqueue_kernel(Kernel::MseDerivatives {
            output,
            target,
            output_error: derivatives,
        });
    }

    fn enqueue_total_error(
        &self,
        context: &mut Context,
        output: Buffer<f32>,
        target: Buffer<f32>,
        errors: Buffer<f32>,
        size: usize,
    ) {
        context.enqueue_kernel(Kernel::MseTotalError {
            output,
            target,
            errors,
            size,
            count: errors.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check;

    const OUTPUT: [f32; 3] = [0., 1., 2.];
    const TARGET: [f32; 3] = [-1., 1., 5.];

    #[test]
    fn squared_error() {
        let loss = Loss::from(MeanSquared);
        let mut error = [0.; 3];
        loss.calculate_error(&OUTPUT, &TARGET, &mut error);
        check(&[1., 0., 9.], &error, 1e-6, "error");
        assert_eq!(loss.total_error(&OUTPUT, &TARGET), 10.);
    }

    #[test]
    fn squared_error_derivatives() {
        let mut derivatives = [0.; 3];
        MeanSquared.calculate_derivatives(&OUTPUT, &TARGET, &mut derivatives);
        check(&[2., 0., -6.], &derivatives, 1e-6, "derivatives");
    }
}
