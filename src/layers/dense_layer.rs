use crate::{
    device::{Buffer, Context, Kernel},
    error::ConfigError,
    initializer::Initializer,
    layers::{BackPropData, DeviceBackPropData, DeviceLayer, Layer},
    tensor::Shape,
};
use serde::{Deserialize, Serialize};

/// Your run of the mill fully connected (dense) layer.
///
/// Parameters are laid out as `output_size` biases followed by the weight
/// matrix in row-major order, one row per output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenseLayer {
    in_size: usize,
    size: usize,
}

impl DenseLayer {
    pub fn new(in_size: usize, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroOutputSize);
        }
        Ok(Self { in_size, size })
    }

    fn split<'a>(&self, params: &'a [f32]) -> (&'a [f32], &'a [f32]) {
        assert_eq!(params.len(), self.parameter_count());
        params.split_at(self.size)
    }
}

impl Layer for DenseLayer {
    fn input_size(&self) -> usize {
        self.in_size
    }

    fn output_size(&self) -> usize {
        self.size
    }

    fn parameter_count(&self) -> usize {
        (self.in_size + 1) * self.size
    }

    fn output_shape(&self, _input: &Shape) -> Shape {
        Shape::from(self.size)
    }

    fn forward(&self, input: &[f32], params: &[f32], output: &mut [f32]) {
        let (biases, weights) = self.split(params);
        assert_eq!(input.len(), self.in_size);
        assert_eq!(output.len(), self.size);

        for ((out, bias), row) in output
            .iter_mut()
            .zip(biases)
            .zip(weights.chunks_exact(self.in_size))
        {
            let mut sum = *bias;
            for (x, w) in input.iter().zip(row) {
                sum += x * w;
            }
            *out = sum;
        }
    }

    fn back_propagate(&self, data: &BackPropData<'_>, input_error: &mut [f32]) {
        let (_, weights) = self.split(data.params);
        assert_eq!(data.output_error.len(), self.size);
        assert_eq!(input_error.len(), self.in_size);

        input_error.iter_mut().for_each(|e| *e = 0.);
        for (oe, row) in data
            .output_error
            .iter()
            .zip(weights.chunks_exact(self.in_size))
        {
            for (ie, w) in input_error.iter_mut().zip(row) {
                *ie += oe * w;
            }
        }
    }

    fn calculate_derivatives(&self, data: &BackPropData<'_>, derivatives: &mut [f32]) {
        assert_eq!(derivatives.len(), self.parameter_count());
        assert_eq!(data.input.len(), self.in_size);
        let (b_derivs, w_derivs) = derivatives.split_at_mut(self.size);

        for (bd, oe) in b_derivs.iter_mut().zip(data.output_error) {
            *bd += *oe;
        }
        for (row, oe) in w_derivs
            .chunks_exact_mut(self.in_size)
            .zip(data.output_error)
        {
            for (wd, x) in row.iter_mut().zip(data.input) {
                *wd += oe * x;
            }
        }
    }

    fn initialize_parameters(&self, params: &mut [f32], init: &mut dyn Initializer) {
        assert_eq!(params.len(), self.parameter_count());
        let (biases, weights) = params.split_at_mut(self.size);
        let bound = 1. / (self.in_size as f32).sqrt();
        for b in biases {
            *b = init.uniform(-1., 1.);
        }
        for w in weights {
            *w = init.uniform(-bound, bound);
        }
    }
}

impl DeviceLayer for DenseLayer {
    fn enqueue_forward(
        &self,
        context: &mut Context,
        input: Buffer<f32>,
        params: Buffer<f32>,
        output: Buffer<f32>,
        count: usize,
    ) {
        context.enqueue_kernel(Kernel::DenseForward {
            input,
            params,
            output,
            in_size: self.in_size,
            out_size: self.size,
            count,
        });
    }

    fn enqueue_back_propagate(
        &self,
        context: &mut Context,
        data: &DeviceBackPropData,
        input_error: Buffer<f32>,
    ) {
        context.enqueue_kernel(Kernel::DenseBackPropagate {
            output_error: data.output_error,
            params: data.params,
            input_error,
            in_size: self.in_size,
            out_size: self.size,
            count: data.count,
        });
    }

    fn enqueue_derivatives(
        &self,
        context: &mut Context,
        data: &DeviceBackPropData,
        derivatives: Buffer<f32>,
    ) {
        context.enqueue_kernel(Kernel::DenseDerivatives {
            input: data.input,
            output_error: data.output_error,
            derivatives,
            in_size: self.in_size,
            out_size: self.size,
            count: data.count,
        });
    }
}
