use super::*;
use crate::device::Kernel;

pub const BETA1: f32 = 0.9;
pub const BETA2: f32 = 0.999;
pub const EPSILON: f32 = 1e-8;

/// The adam optimizer algorithm as shown in the research paper <https://arxiv.org/abs/1412.6980>
///
/// State layout: first moments, second moments, then the running powers of
/// beta1 and beta2. The powers start at beta1 and beta2 and advance once per update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    l_rate: f32,
}

impl Adam {
    pub fn new(l_rate: f32) -> Self {
        Self { l_rate }
    }

    pub fn l_rate(&self) -> f32 {
        self.l_rate
    }
}

impl Optimizer for Adam {
    fn state_size(&self, parameter_count: usize) -> usize {
        parameter_count * 2 + 2
    }

    fn init(&self, state: &mut [f32]) {
        let n = state.len() - 2;
        zero(&mut state[..n]);
        state[n] = BETA1;
        state[n + 1] = BETA2;
    }

    fn update(&self, params: &mut [f32], derivatives: &[f32], state: &mut [f32], batch_size: usize) {
        let n = params.len();
        assert_eq!(derivatives.len(), n);
        assert_eq!(state.len(), self.state_size(n));

        let (moments, powers) = state.split_at_mut(2 * n);
        let (momentum, velocity) = moments.split_at_mut(n);
        let scale = step_scale(self.l_rate, batch_size);

        for (((p, g), m), v) in params
            .iter_mut()
            .zip(derivatives)
            .zip(momentum.iter_mut())
            .zip(velocity.iter_mut())
        {
            *m = BETA1 * *m + (1. - BETA1) * g;
            *v = BETA2 * *v + (1. - BETA2) * g * g;
            let m_hat = *m / (1. - powers[0]);
            let v_hat = *v / (1. - powers[1]);
            *p -= scale * m_hat / (v_hat.sqrt() + EPSILON);
        }

        powers[0] *= BETA1;
        powers[1] *= BETA2;
    }
}

impl DeviceOptimizer for Adam {
    fn enqueue_update(
        &self,
        context: &mut Context,
        params: Buffer<f32>,
        derivatives: Buffer<f32>,
        state: Buffer<f32>,
        batch_size: usize,
    ) -> Result<(), DeviceError> {
        // the state buffer ends with the two powers
        let powers = state.sub_buffer(state.len().saturating_sub(2), 2)?;
        context.enqueue_kernel(Kernel::AdamUpdate {
            params,
            derivatives,
            state,
            scale: step_scale(self.l_rate, batch_size),
            beta1: BETA1,
            beta2: BETA2,
            epsilon: EPSILON,
        });
        context.enqueue_kernel(Kernel::AdamUpdateBetas {
            powers,
            beta1: BETA1,
            beta2: BETA2,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let adam = Adam::new(0.1);
        let mut state = vec![0.; adam.state_size(2)];
        adam.init(&mut state);
        assert_eq!(&state[4..], &[BETA1, BETA2]);

        let mut params = [1., 1.];
        adam.update(&mut params, &[2., -2.], &mut state, 2);
        // bias correction makes the first step exactly lr / batch in the direction of the gradient
        check(&[0.95, 1.05], &params, 1e-5, "parameters");
        check(&[BETA1 * BETA1, BETA2 * BETA2], &state[4..], 1e-7, "powers");
    }

    #[test]
    fn powers_advance_once_per_update() {
        let adam = Adam::new(0.01);
        let mut state = vec![0.; adam.state_size(1)];
        adam.init(&mut state);
        let mut params = [0.];
        for _ in 0..3 {
            adam.update(&mut params, &[1.], &mut state, 5);
        }
        check(&[BETA1.powi(4), BETA2.powi(4)], &state[2..], 1e-6, "powers");
    }

    #[test]
    fn short_state_is_rejected_before_enqueueing() {
        use crate::{device::DeviceOptions, error::DeviceError};
        use assert_matches::assert_matches;

        let adam = Adam::new(0.01);
        let mut context = Context::new(DeviceOptions::software()).unwrap();
        let params = context.create_buffer::<f32>(2).unwrap();
        let derivatives = context.create_buffer::<f32>(2).unwrap();
        let short = context.create_buffer::<f32>(1).unwrap();
        assert_matches!(
            adam.enqueue_update(&mut context, params, derivatives, short, 1),
            Err(DeviceError::OutOfBounds { .. })
        );
        assert_eq!(context.pending(), 0);

        let state = context.create_buffer::<f32>(adam.state_size(2)).unwrap();
        adam.enqueue_update(&mut context, params, derivatives, state, 1).unwrap();
        assert_eq!(context.pending(), 2);
    }
}
