use super::*;

/// Gradient descent simply steps the weights against their derivatives,
/// averaged over the batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientDescent {
    l_rate: f32,
}

impl GradientDescent {
    pub fn new(l_rate: f32) -> Self {
        Self { l_rate }
    }

    pub fn l_rate(&self) -> f32 {
        self.l_rate
    }
}

impl Optimizer for GradientDescent {
    fn state_size(&self, _parameter_count: usize) -> usize {
        0
    }

    fn init(&self, _state: &mut [f32]) {}

    fn update(&self, params: &mut [f32], derivatives: &[f32], _state: &mut [f32], batch_size: usize) {
        assert_eq!(params.len(), derivatives.len());
        let k = step_scale(self.l_rate, batch_size);
        for (p, d) in params.iter_mut().zip(derivatives) {
            *p -= k * d;
        }
    }
}

impl DeviceOptimizer for GradientDescent {
    fn enqueue_update(
        &self,
        context: &mut Context,
        params: Buffer<f32>,
        derivatives: Buffer<f32>,
        _state: Buffer<f32>,
        batch_size: usize,
    ) -> Result<(), DeviceError> {
        context.enqueue_kernel(crate::device::Kernel::GradientStep {
            params,
            derivatives,
            scale: step_scale(self.l_rate, batch_size),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check;

    #[test]
    fn step_is_averaged_over_batch() {
        let optimizer = GradientDescent::new(0.5);
        let mut params = [1., 2.];
        optimizer.update(&mut params, &[4., -8.], &mut [], 4);
        check(&[0.5, 3.], &params, 1e-6, "parameters");
    }
}
