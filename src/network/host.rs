use super::{
    activation_layout, check_inputs, check_targets, initial_parameters, Engine, NetworkConfig,
    TargetData,
};
use crate::{
    error::{ConfigError, Result},
    helpers::arg_max,
    layers::{BackPropData, Layer},
    loss::LossFunc,
    optimizer::Optimizer,
    storage::{Handle, Storage},
};

use tracing::debug;

use std::sync::Arc;

/// Target of a single example.
#[derive(Debug, Clone, Copy)]
enum ExampleTarget<'a> {
    Value(&'a [f32]),
    Label(u32),
}

fn example_target(targets: TargetData<'_>, index: usize, size: usize) -> ExampleTarget<'_> {
    match targets {
        TargetData::Values(values) => ExampleTarget::Value(&values[index * size..(index + 1) * size]),
        TargetData::Labels(labels) => ExampleTarget::Label(labels[index]),
    }
}

/// Executes the network with straight loops over flat host buffers. Every
/// buffer is allocated once, here, and reused by every call.
#[derive(Debug)]
pub struct HostEngine {
    config: Arc<NetworkConfig>,
    /// Region of every layer in the parameter and derivative storages.
    parameter_handles: Vec<Handle>,
    /// Region of every layer in the activation and error storages.
    activation_handles: Vec<Handle>,
    parameters: Storage,
    derivatives: Storage,
    optimizer_state: Vec<f32>,
    activations: Storage,
    errors: Storage,
}

impl HostEngine {
    pub fn new(config: Arc<NetworkConfig>) -> Self {
        let (parameter_handles, initial) = initial_parameters(&config);
        let mut parameters = Storage::zeroed(initial.len());
        parameters.raw_mut().copy_from_slice(&initial);
        let derivatives = Storage::zeroed(initial.len());

        let optimizer_state = match config.optimizer() {
            Some(optimizer) => {
                let mut state = vec![0.; optimizer.state_size(initial.len())];
                optimizer.init(&mut state);
                state
            }
            None => Vec::new(),
        };

        let (alloc, activation_handles) = activation_layout(&config, 1);
        let activations = alloc.finish();
        let errors = alloc.finish();

        debug!(
            parameters = initial.len(),
            layers = config.layers().len(),
            "initialized host engine"
        );

        Self {
            config,
            parameter_handles,
            activation_handles,
            parameters,
            derivatives,
            optimizer_state,
            activations,
            errors,
        }
    }

    /// Derivatives accumulated over the most recent batch.
    pub fn derivatives(&self) -> &[f32] {
        self.derivatives.raw()
    }

    /// Run one example through every layer. The result is left in the last
    /// layer's activation region.
    fn forward_example(&mut self, input: &[f32]) {
        let handles = &self.activation_handles;
        for (i, layer) in self.config.layers().iter().enumerate() {
            let params = self.parameters.get(self.parameter_handles[i]);
            if i == 0 {
                layer.forward(input, params, self.activations.get_mut(handles[0]));
            } else {
                let (previous, output) = self.activations.split_pair(handles[i - 1], handles[i]);
                layer.forward(previous, params, output);
            }
        }
    }

    fn output(&self) -> &[f32] {
        let last = self.activation_handles.len() - 1;
        self.activations.get(self.activation_handles[last])
    }

    /// Propagate the error of the last forward pass back through the network,
    /// adding every layer's parameter derivatives to the derivative storage.
    fn backward_example(&mut self, input: &[f32], target: ExampleTarget<'_>) -> Result<()> {
        let config = Arc::clone(&self.config);
        let layers = config.layers();
        let handles = &self.activation_handles;
        let last = layers.len() - 1;

        {
            let output = self.activations.get(handles[last]);
            let output_error = self.errors.get_mut(handles[last]);
            match target {
                ExampleTarget::Value(target) => {
                    let loss = config.loss().ok_or(ConfigError::MissingLoss)?;
                    loss.calculate_derivatives(output, target, output_error);
                }
                ExampleTarget::Label(label) => {
                    output_error.copy_from_slice(output);
                    output_error[label as usize] -= 1.;
                }
            }
        }

        for (i, layer) in layers.iter().enumerate().rev() {
            let layer_input = if i == 0 {
                input
            } else {
                self.activations.get(handles[i - 1])
            };
            let (input_error, output_error) = if i == 0 {
                (None, self.errors.get(handles[0]))
            } else {
                let (previous, current) = self.errors.split_pair(handles[i - 1], handles[i]);
                (Some(previous), &*current)
            };
            let data = BackPropData {
                input: layer_input,
                output: self.activations.get(handles[i]),
                output_error,
                params: self.parameters.get(self.parameter_handles[i]),
            };
            if let Some(input_error) = input_error {
                layer.back_propagate(&data, input_error);
            }
            layer.calculate_derivatives(&data, self.derivatives.get_mut(self.parameter_handles[i]));
        }
        Ok(())
    }
}

impl Engine for HostEngine {
    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn forward(&mut self, inputs: &[f32], count: usize) -> Result<Vec<f32>> {
        check_inputs(&self.config, inputs, count)?;
        let in_size = self.config.input_size();
        let mut outputs = Vec::with_capacity(count * self.config.output_size());
        for input in inputs.chunks_exact(in_size) {
            self.forward_example(input);
            outputs.extend_from_slice(self.output());
        }
        Ok(outputs)
    }

    fn classify(&mut self, inputs: &[f32], count: usize) -> Result<Vec<u32>> {
        check_inputs(&self.config, inputs, count)?;
        let in_size = self.config.input_size();
        let mut classes = Vec::with_capacity(count);
        for input in inputs.chunks_exact(in_size) {
            self.forward_example(input);
            classes.push(arg_max(self.output()) as u32);
        }
        Ok(classes)
    }

    fn test(&mut self, inputs: &[f32], targets: TargetData<'_>, count: usize) -> Result<f32> {
        if count == 0 {
            return Err(ConfigError::NoExamples.into());
        }
        check_inputs(&self.config, inputs, count)?;
        check_targets(&self.config, targets, count)?;
        let config = Arc::clone(&self.config);
        let (in_size, out_size) = (config.input_size(), config.output_size());

        let mut total = 0.;
        for (i, input) in inputs.chunks_exact(in_size).enumerate() {
            self.forward_example(input);
            total += match example_target(targets, i, out_size) {
                ExampleTarget::Value(target) => config
                    .loss()
                    .ok_or(ConfigError::MissingLoss)?
                    .total_error(self.output(), target),
                ExampleTarget::Label(label) => (arg_max(self.output()) == label as usize) as u8 as f32,
            };
        }
        Ok(total / count as f32)
    }

    fn train(
        &mut self,
        inputs: &[f32],
        targets: TargetData<'_>,
        count: usize,
        epochs: usize,
    ) -> Result<()> {
        check_inputs(&self.config, inputs, count)?;
        check_targets(&self.config, targets, count)?;
        let config = Arc::clone(&self.config);
        let optimizer = config.optimizer().ok_or(ConfigError::MissingOptimizer)?;
        let (in_size, out_size) = (config.input_size(), config.output_size());
        let batch_size = config.batch_size();

        for epoch in 0..epochs {
            for start in (0..count).step_by(batch_size) {
                let end = (start + batch_size).min(count);
                optimizer.begin_batch(self.derivatives.raw_mut());
                for i in start..end {
                    let input = &inputs[i * in_size..(i + 1) * in_size];
                    self.forward_example(input);
                    self.backward_example(input, example_target(targets, i, out_size))?;
                }
                optimizer.update(
                    self.parameters.raw_mut(),
                    self.derivatives.raw(),
                    &mut self.optimizer_state,
                    end - start,
                );
            }
            debug!(epoch, "finished epoch");
        }
        Ok(())
    }

    fn read_parameters(&mut self) -> Result<Vec<f32>> {
        Ok(self.parameters.raw().to_vec())
    }

    fn write_parameters(&mut self, parameters: &[f32]) -> Result<()> {
        let expected = self.parameters.raw().len();
        if parameters.len() != expected {
            return Err(ConfigError::ParameterCount {
                expected,
                received: parameters.len(),
            }
            .into());
        }
        self.parameters.raw_mut().copy_from_slice(parameters);
        Ok(())
    }
}
