use super::memory::{Buffer, Memory};
use crate::{error::DeviceError, helpers::arg_max, layers::sigmoid_layer::sigmoid};

/// A compute kernel bound to its arguments. Every kernel processes a whole
/// dispatch worth of examples; the per-element work is written as the body a
/// single work item would run, in the same order as `kernels.cl`.
#[derive(Debug, Clone)]
pub enum Kernel {
    Fill {
        buffer: Buffer<f32>,
        value: f32,
    },
    DenseForward {
        input: Buffer<f32>,
        params: Buffer<f32>,
        output: Buffer<f32>,
        in_size: usize,
        out_size: usize,
        count: usize,
    },
    DenseBackPropagate {
        output_error: Buffer<f32>,
        params: Buffer<f32>,
        input_error: Buffer<f32>,
        in_size: usize,
        out_size: usize,
        count: usize,
    },
    /// Accumulates into `derivatives`, summing over every example of the dispatch.
    DenseDerivatives {
        input: Buffer<f32>,
        output_error: Buffer<f32>,
        derivatives: Buffer<f32>,
        in_size: usize,
        out_size: usize,
        count: usize,
    },
    SigmoidForward {
        input: Buffer<f32>,
        output: Buffer<f32>,
    },
    SigmoidBackPropagate {
        input: Buffer<f32>,
        output_error: Buffer<f32>,
        input_error: Buffer<f32>,
    },
    MseDerivatives {
        output: Buffer<f32>,
        target: Buffer<f32>,
        output_error: Buffer<f32>,
    },
    /// One summed squared error per example.
    MseTotalError {
        output: Buffer<f32>,
        target: Buffer<f32>,
        errors: Buffer<f32>,
        size: usize,
        count: usize,
    },
    LabelError {
        output: Buffer<f32>,
        labels: Buffer<u32>,
        output_error: Buffer<f32>,
        size: usize,
        count: usize,
    },
    Classify {
        output: Buffer<f32>,
        classes: Buffer<u32>,
        size: usize,
        count: usize,
    },
    GradientStep {
        params: Buffer<f32>,
        derivatives: Buffer<f32>,
        scale: f32,
    },
    /// `state` holds the first moments, the second moments and the two power terms.
    AdamUpdate {
        params: Buffer<f32>,
        derivatives: Buffer<f32>,
        state: Buffer<f32>,
        scale: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    AdamUpdateBetas {
        powers: Buffer<f32>,
        beta1: f32,
        beta2: f32,
    },
}

fn expect_len(kernel: &Kernel, what: &str, len: usize, expected: usize) -> Result<(), DeviceError> {
    if len != expected {
        return Err(DeviceError::InvalidArguments {
            kernel: kernel.name(),
            reason: format!("{} holds {} elements, expected {}", what, len, expected),
        });
    }
    Ok(())
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Fill { .. } => "fill",
            Kernel::DenseForward { .. } => "dense_forward",
            Kernel::DenseBackPropagate { .. } => "dense_back_propagate",
            Kernel::DenseDerivatives { .. } => "dense_derivatives",
            Kernel::SigmoidForward { .. } => "sigmoid_forward",
            Kernel::SigmoidBackPropagate { .. } => "sigmoid_back_propagate",
            Kernel::MseDerivatives { .. } => "mse_derivatives",
            Kernel::MseTotalError { .. } => "mse_total_error",
            Kernel::LabelError { .. } => "label_error",
            Kernel::Classify { .. } => "classify",
            Kernel::GradientStep { .. } => "gradient_step",
            Kernel::AdamUpdate { .. } => "adam_update",
            Kernel::AdamUpdateBetas { .. } => "adam_update_betas",
        }
    }

    /// Check argument sizes before anything is written.
    pub(crate) fn validate(&self) -> Result<(), DeviceError> {
        match *self {
            Kernel::Fill { .. } => Ok(()),
            Kernel::DenseForward { input, params, output, in_size, out_size, count } => {
                expect_len(self, "input", input.len(), in_size * count)?;
                expect_len(self, "params", params.len(), (in_size + 1) * out_size)?;
                expect_len(self, "output", output.len(), out_size * count)
            }
            Kernel::DenseBackPropagate { output_error, params, input_error, in_size, out_size, count } => {
                expect_len(self, "output error", output_error.len(), out_size * count)?;
                expect_len(self, "params", params.len(), (in_size + 1) * out_size)?;
                expect_len(self, "input error", input_error.len(), in_size * count)
            }
            Kernel::DenseDerivatives { input, output_error, derivatives, in_size, out_size, count } => {
                expect_len(self, "input", input.len(), in_size * count)?;
                expect_len(self, "output error", output_error.len(), out_size * count)?;
                expect_len(self, "derivatives", derivatives.len(), (in_size + 1) * out_size)
            }
            Kernel::SigmoidForward { input, output } => {
                expect_len(self, "output", output.len(), input.len())
            }
            Kernel::SigmoidBackPropagate { input, output_error, input_error } => {
                expect_len(self, "output error", output_error.len(), input.len())?;
                expect_len(self, "input error", input_error.len(), input.len())
            }
            Kernel::MseDerivatives { output, target, output_error } => {
                expect_len(self, "target", target.len(), output.len())?;
                expect_len(self, "output error", output_error.len(), output.len())
            }
            Kernel::MseTotalError { output, target, errors, size, count } => {
                expect_len(self, "output", output.len(), size * count)?;
                expect_len(self, "target", target.len(), size * count)?;
                expect_len(self, "errors", errors.len(), count)
            }
            Kernel::LabelError { output, labels, output_error, size, count } => {
                expect_len(self, "output", output.len(), size * count)?;
                expect_len(self, "labels", labels.len(), count)?;
                expect_len(self, "output error", output_error.len(), size * count)
            }
            Kernel::Classify { output, classes, size, count } => {
                expect_len(self, "output", output.len(), size * count)?;
                expect_len(self, "classes", classes.len(), count)
            }
            Kernel::GradientStep { params, derivatives, .. } => {
                expect_len(self, "derivatives", derivatives.len(), params.len())
            }
            Kernel::AdamUpdate { params, derivatives, state, .. } => {
                expect_len(self, "derivatives", derivatives.len(), params.len())?;
                expect_len(self, "state", state.len(), params.len() * 2 + 2)
            }
            Kernel::AdamUpdateBetas { powers, .. } => expect_len(self, "powers", powers.len(), 2),
        }
    }

    pub(crate) fn execute(&self, memory: &mut Memory) -> Result<(), DeviceError> {
        self.validate()?;
        match *self {
            Kernel::Fill { buffer, value } => memory.with_mut(buffer, |_, data| {
                data.iter_mut().for_each(|x| *x = value);
                Ok(())
            }),
            Kernel::DenseForward { input, params, output, in_size, out_size, count } => {
                memory.with_mut(output, |memory, output| {
                    let input = memory.view(input)?;
                    let (bias, weight) = memory.view(params)?.split_at(out_size);
                    for gid in 0..count * out_size {
                        let (e, i) = (gid / out_size, gid % out_size);
                        let input = &input[e * in_size..(e + 1) * in_size];
                        let row = &weight[i * in_size..(i + 1) * in_size];
                        let mut sum = bias[i];
                        for (x, w) in input.iter().zip(row) {
                            sum += x * w;
                        }
                        output[gid] = sum;
                    }
                    Ok(())
                })
            }
            Kernel::DenseBackPropagate { output_error, params, input_error, in_size, out_size, count } => {
                memory.with_mut(input_error, |memory, input_error| {
                    let output_error = memory.view(output_error)?;
                    let weight = &memory.view(params)?[out_size..];
                    for gid in 0..count * in_size {
                        let (e, j) = (gid / in_size, gid % in_size);
                        let mut sum = 0.;
                        for i in 0..out_size {
                            sum += output_error[e * out_size + i] * weight[i * in_size + j];
                        }
                        input_error[gid] = sum;
                    }
                    Ok(())
                })
            }
            Kernel::DenseDerivatives { input, output_error, derivatives, in_size, out_size, count } => {
                memory.with_mut(derivatives, |memory, derivatives| {
                    let input = memory.view(input)?;
                    let output_error = memory.view(output_error)?;
                    let (d_bias, d_weight) = derivatives.split_at_mut(out_size);
                    for (i, db) in d_bias.iter_mut().enumerate() {
                        for e in 0..count {
                            *db += output_error[e * out_size + i];
                        }
                    }
                    for (gid, dw) in d_weight.iter_mut().enumerate() {
                        let (i, j) = (gid / in_size, gid % in_size);
                        for e in 0..count {
                            *dw += output_error[e * out_size + i] * input[e * in_size + j];
                        }
                    }
                    Ok(())
                })
            }
            Kernel::SigmoidForward { input, output } => memory.with_mut(output, |memory, output| {
                for (o, x) in output.iter_mut().zip(memory.view(input)?) {
                    *o = sigmoid(*x);
                }
                Ok(())
            }),
            Kernel::SigmoidBackPropagate { input, output_error, input_error } => {
                memory.with_mut(input_error, |memory, input_error| {
                    let input = memory.view(input)?;
                    let output_error = memory.view(output_error)?;
                    for ((ie, x), oe) in input_error.iter_mut().zip(input).zip(output_error) {
                        let s = sigmoid(*x);
                        *ie = s * (1. - s) * *oe;
                    }
                    Ok(())
                })
            }
            Kernel::MseDerivatives { output, target, output_error } => {
                memory.with_mut(output_error, |memory, output_error| {
                    let output = memory.view(output)?;
                    let target = memory.view(target)?;
                    for ((d, o), t) in output_error.iter_mut().zip(output).zip(target) {
                        *d = 2. * (o - t);
                    }
                    Ok(())
                })
            }
            Kernel::MseTotalError { output, target, errors, size, .. } => {
                memory.with_mut(errors, |memory, errors| {
                    let output = memory.view(output)?;
                    let target = memory.view(target)?;
                    for (e, total) in errors.iter_mut().enumerate() {
                        let mut sum = 0.;
                        for k in e * size..(e + 1) * size {
                            let diff = output[k] - target[k];
                            sum += diff * diff;
                        }
                        *total = sum;
                    }
                    Ok(())
                })
            }
            Kernel::LabelError { output, labels, output_error, size, .. } => {
                memory.with_mut(output_error, |memory, output_error| {
                    let output = memory.view(output)?;
                    output_error.copy_from_slice(output);
                    for (e, label) in memory.view(labels)?.iter().enumerate() {
                        let label = *label as usize;
                        if label >= size {
                            return Err(DeviceError::InvalidArguments {
                                kernel: "label_error",
                                reason: format!("label {} is out of range for {} classes", label, size),
                            });
                        }
                        output_error[e * size + label] -= 1.;
                    }
                    Ok(())
                })
            }
            Kernel::Classify { output, classes, size, .. } => memory.with_mut(classes, |memory, classes| {
                let output = memory.view(output)?;
                for (e, class) in classes.iter_mut().enumerate() {
                    *class = arg_max(&output[e * size..(e + 1) * size]) as u32;
                }
                Ok(())
            }),
            Kernel::GradientStep { params, derivatives, scale } => {
                memory.with_mut(params, |memory, params| {
                    for (p, d) in params.iter_mut().zip(memory.view(derivatives)?) {
                        *p -= scale * d;
                    }
                    Ok(())
                })
            }
            Kernel::AdamUpdate { params, derivatives, state, scale, beta1, beta2, epsilon } => {
                memory.with_mut2(params, state, |memory, params, state| {
                    let derivatives = memory.view(derivatives)?;
                    let n = params.len();
                    let (moments, powers) = state.split_at_mut(2 * n);
                    let (m, v) = moments.split_at_mut(n);
                    let (beta1_pow, beta2_pow) = (powers[0], powers[1]);
                    for gid in 0..n {
                        let g = derivatives[gid];
                        m[gid] = beta1 * m[gid] + (1. - beta1) * g;
                        v[gid] = beta2 * v[gid] + (1. - beta2) * g * g;
                        let m_hat = m[gid] / (1. - beta1_pow);
                        let v_hat = v[gid] / (1. - beta2_pow);
                        params[gid] -= scale * m_hat / (v_hat.sqrt() + epsilon);
                    }
                    Ok(())
                })
            }
            Kernel::AdamUpdateBetas { powers, beta1, beta2 } => memory.with_mut(powers, |_, powers| {
                powers[0] *= beta1;
                powers[1] *= beta2;
                Ok(())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check;

    #[test]
    fn dense_kernels_match_reference_values() {
        let mut memory = Memory::new(None);
        let input = memory.allocate::<f32>(2).unwrap();
        let params = memory.allocate::<f32>(6).unwrap();
        let output = memory.allocate::<f32>(2).unwrap();
        memory.write(input, &[-1., 1.]).unwrap();
        memory.write(params, &[2., -1., 1., 3., -2., 4.]).unwrap();

        Kernel::DenseForward { input, params, output, in_size: 2, out_size: 2, count: 1 }
            .execute(&mut memory)
            .unwrap();
        check(&[4., 5.], memory.view(output).unwrap(), 1e-6, "output");

        let derivatives = memory.allocate::<f32>(6).unwrap();
        memory.write(output, &[3., 4.]).unwrap();
        let kernel = Kernel::DenseDerivatives {
            input,
            output_error: output,
            derivatives,
            in_size: 2,
            out_size: 2,
            count: 1,
        };
        kernel.execute(&mut memory).unwrap();
        check(&[3., 4., -3., 3., -4., 4.], memory.view(derivatives).unwrap(), 1e-6, "derivatives");
        // derivatives accumulate
        kernel.execute(&mut memory).unwrap();
        check(&[6., 8., -6., 6., -8., 8.], memory.view(derivatives).unwrap(), 1e-6, "derivatives");
    }

    #[test]
    fn argument_sizes_are_checked() {
        let mut memory = Memory::new(None);
        let a = memory.allocate::<f32>(3).unwrap();
        let classes = memory.allocate::<u32>(2).unwrap();
        let result = Kernel::Classify { output: a, classes, size: 2, count: 2 }.execute(&mut memory);
        assert!(matches!(result, Err(DeviceError::InvalidArguments { kernel: "classify", .. })));
    }
}
