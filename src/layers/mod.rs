pub mod dense_layer;
pub mod sigmoid_layer;

pub use self::dense_layer::DenseLayer;
pub use self::sigmoid_layer::SigmoidLayer;

use crate::{
    device::{Buffer, Context},
    initializer::Initializer,
    tensor::Shape,
};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// Views handed to a layer while propagating one example backwards.
#[derive(Debug, Clone, Copy)]
pub struct BackPropData<'a> {
    /// Input the layer saw in the forward pass.
    pub input: &'a [f32],
    /// Output the layer produced in the forward pass.
    pub output: &'a [f32],
    /// Derivative of the loss with respect to `output`.
    pub output_error: &'a [f32],
    pub params: &'a [f32],
}

/// The device counterpart of [BackPropData], covering a whole dispatch of `count` examples.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBackPropData {
    pub input: Buffer<f32>,
    pub output: Buffer<f32>,
    pub output_error: Buffer<f32>,
    pub params: Buffer<f32>,
    pub count: usize,
}

/// Layers are stateless. Every buffer they read or write belongs to the engine
/// driving them, and sizes are fixed at construction.
#[enum_dispatch]
pub trait Layer {
    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;
    fn parameter_count(&self) -> usize;

    /// Shape of the output given the shape of the input.
    fn output_shape(&self, input: &Shape) -> Shape;

    fn forward(&self, input: &[f32], params: &[f32], output: &mut [f32]);

    /// Compute the derivative of the loss with respect to the layer's input.
    /// `input_error` is overwritten.
    fn back_propagate(&self, data: &BackPropData<'_>, input_error: &mut [f32]);

    /// Add this example's parameter derivatives to `derivatives`.
    fn calculate_derivatives(&self, data: &BackPropData<'_>, derivatives: &mut [f32]);

    fn initialize_parameters(&self, params: &mut [f32], init: &mut dyn Initializer);
}

/// Enqueues the kernels implementing a layer on the accelerator. The results
/// must match [Layer] within floating point tolerance.
#[enum_dispatch]
pub trait DeviceLayer: Layer {
    fn enqueue_forward(
        &self,
        context: &mut Context,
        input: Buffer<f32>,
        params: Buffer<f32>,
        output: Buffer<f32>,
        count: usize,
    );

    fn enqueue_back_propagate(
        &self,
        context: &mut Context,
        data: &DeviceBackPropData,
        input_error: Buffer<f32>,
    );

    fn enqueue_derivatives(
        &self,
        context: &mut Context,
        data: &DeviceBackPropData,
        derivatives: Buffer<f32>,
    );
}

/// Closed set of layer variants, so networks can be stored and serialized
/// without boxing.
#[enum_dispatch(Layer)]
#[enum_dispatch(DeviceLayer)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BasicLayer {
    Dense(DenseLayer),
    Sigmoid(SigmoidLayer),
}

#[cfg(test)]
pub(crate) mod tests {
    /// Compares two arrays with the given error tolerance. Returns None if either of the arrays contains NaN.
    pub(crate) fn is_equal_ish(left: &[f32], right: &[f32], tolerance: f32) -> Option<bool> {
        assert_eq!(left.len(), right.len());
        let err = left
            .iter()
            .zip(right)
            .map(|(l, r)| f32::abs(l - r))
            .try_fold(0f32, |a, b| a.partial_cmp(&b).map(|_| a.max(b)));
        err.map(|e| e < tolerance)
    }

    pub(crate) fn check(expected: &[f32], output: &[f32], tolerance: f32, id: &str) {
        let diag = || format!("expected: {:?}\nreceived: {:?}", expected, output);

        match is_equal_ish(expected, output, tolerance) {
            Some(true) => {}
            Some(false) => panic!("Evaluation produced incorrect {}.\n{}", id, diag()),
            None => panic!("Evaluation produced a NaN\n{}", diag()),
        }
    }
}
