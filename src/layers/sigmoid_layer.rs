use crate::{
    device::{Buffer, Context, Kernel},
    initializer::Initializer,
    layers::{BackPropData, DeviceBackPropData, DeviceLayer, Layer},
    tensor::Shape,
};
use serde::{Deserialize, Serialize};

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// Applies the logistic function to every element. Has no parameters and
/// keeps the shape of its input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SigmoidLayer {
    size: usize,
}

impl SigmoidLayer {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Layer for SigmoidLayer {
    fn input_size(&self) -> usize {
        self.size
    }

    fn output_size(&self) -> usize {
        self.size
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn output_shape(&self, input: &Shape) -> Shape {
        input.clone()
    }

    fn forward(&self, input: &[f32], _params: &[f32], output: &mut [f32]) {
        assert_eq!(input.len(), output.len());
        for (o, x) in output.iter_mut().zip(input) {
            *o = sigmoid(*x);
        }
    }

    /// The derivative is recomputed from the pre-activation input rather than
    /// read back from the stored output.
    fn back_propagate(&self, data: &BackPropData<'_>, input_error: &mut [f32]) {
        assert_eq!(data.input.len(), input_error.len());
        for ((ie, x), oe) in input_error
            .iter_mut()
            .zip(data.input)
            .zip(data.output_error)
        {
            let s = sigmoid(*x);
            *ie = s * (1. - s) * *oe;
        }
    }

    fn calculate_derivatives(&self, _data: &BackPropData<'_>, _derivatives: &mut [f32]) {}

    fn initialize_parameters(&self, _params: &mut [f32], _init: &mut dyn Initializer) {}
}

impl DeviceLayer for SigmoidLayer {
    fn enqueue_forward(
        &self,
        context: &mut Context,
        input: Buffer<f32>,
        _params: Buffer<f32>,
        output: Buffer<f32>,
        _count: usize,
    ) {
        context.enqueue_kernel(Kernel::SigmoidForward { input, output });
    }

    fn enqueue_back_propagate(
        &self,
        context: &mut Context,
        data: &DeviceBackPropData,
        input_error: Buffer<f32>,
    ) {
        context.enqueue_kernel(Kernel::SigmoidBackPropagate {
            input: data.input,
            output_error: data.output_error,
            input_error,
        });
    }

    fn enqueue_derivatives(&self, _: &mut Context, _: &DeviceBackPropData, _: Buffer<f32>) {}
}
