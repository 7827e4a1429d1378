use super::{check_inputs, check_targets, initial_parameters, Engine, NetworkConfig, TargetData};
use crate::{
    device::{Buffer, Context, DeviceElement, Kernel},
    error::{ConfigError, DeviceError, Result},
    layers::{DeviceBackPropData, DeviceLayer, Layer},
    loss::{DeviceLoss, Loss},
    optimizer::{DeviceOptimizer, Optimizer},
};

use tracing::{debug, warn};

use std::sync::Arc;

/// Buffers exchanging data with the host. They are kept between calls and
/// only reallocated when a call needs more room than the previous ones.
#[derive(Debug, Default)]
struct Staging {
    inputs: Option<Buffer<f32>>,
    targets: Option<Buffer<f32>>,
    outputs: Option<Buffer<f32>>,
    errors: Option<Buffer<f32>>,
    labels: Option<Buffer<u32>>,
    classes: Option<Buffer<u32>>,
}

impl Staging {
    /// A region of exactly `len` elements, growing the buffer in `slot` if it is too small.
    fn reserve<T: DeviceElement>(
        context: &mut Context,
        slot: &mut Option<Buffer<T>>,
        len: usize,
    ) -> Result<Buffer<T>, DeviceError> {
        if let Some(buffer) = *slot {
            if buffer.len() >= len {
                return buffer.sub_buffer(0, len);
            }
            *slot = None;
            context.release_buffer(buffer)?;
        }
        let buffer = context.create_buffer(len)?;
        debug!(len, "grew staging buffer");
        *slot = Some(buffer);
        Ok(buffer)
    }

    /// Release every staging buffer, reporting the first failure.
    fn release(&mut self, context: &mut Context) -> Result<(), DeviceError> {
        let mut result = Ok(());
        for slot in [&mut self.inputs, &mut self.targets, &mut self.outputs, &mut self.errors] {
            if let Some(buffer) = slot.take() {
                result = result.and(context.release_buffer(buffer));
            }
        }
        for slot in [&mut self.labels, &mut self.classes] {
            if let Some(buffer) = slot.take() {
                result = result.and(context.release_buffer(buffer));
            }
        }
        result
    }
}

/// Buffers that live as long as the engine.
#[derive(Debug)]
struct Resident {
    parameters: Buffer<f32>,
    derivatives: Buffer<f32>,
    optimizer_state: Buffer<f32>,
    /// Per layer activations for one sub-batch.
    outputs: Vec<Buffer<f32>>,
    /// Per layer output errors for one sub-batch.
    errors: Vec<Buffer<f32>>,
}

/// Executes the network on an accelerator [Context]. Examples are processed
/// in sub-batches of at most the context's capacity, every layer handling a
/// whole sub-batch with one kernel dispatch. The optimizer still steps once
/// per logical batch, so results match [HostEngine](super::HostEngine).
#[derive(Debug)]
pub struct DeviceEngine {
    config: Arc<NetworkConfig>,
    context: Context,
    capacity: usize,
    parameters: Buffer<f32>,
    derivatives: Buffer<f32>,
    optimizer_state: Buffer<f32>,
    layer_parameters: Vec<Buffer<f32>>,
    layer_derivatives: Vec<Buffer<f32>>,
    outputs: Vec<Buffer<f32>>,
    errors: Vec<Buffer<f32>>,
    staging: Staging,
}

impl DeviceEngine {
    /// Allocates every resident buffer and uploads the initial parameters. If
    /// anything fails, whatever was already allocated is released again.
    pub fn new(config: Arc<NetworkConfig>, mut context: Context) -> Result<Self, DeviceError> {
        let capacity = context.sub_batch_capacity();
        let (parameter_handles, initial) = initial_parameters(&config);
        let state = match config.optimizer() {
            Some(optimizer) => {
                let mut state = vec![0.; optimizer.state_size(initial.len())];
                optimizer.init(&mut state);
                state
            }
            None => Vec::new(),
        };

        let mut allocated = Vec::new();
        let resident = match Self::upload(&config, &mut context, &mut allocated, &initial, &state) {
            Ok(resident) => resident,
            Err(e) => {
                context.abort();
                for buffer in allocated {
                    if let Err(release) = context.release_buffer(buffer) {
                        warn!(error = %release, "failed to release device memory");
                    }
                }
                return Err(e);
            }
        };

        let sections = |buffer: Buffer<f32>| -> Result<Vec<Buffer<f32>>, DeviceError> {
            parameter_handles
                .iter()
                .map(|h| buffer.sub_buffer(h.start(), h.len()))
                .collect()
        };
        let layer_parameters = sections(resident.parameters)?;
        let layer_derivatives = sections(resident.derivatives)?;

        debug!(
            parameters = initial.len(),
            layers = config.layers().len(),
            capacity,
            memory = context.memory_in_use(),
            "initialized accelerator engine"
        );

        Ok(Self {
            config,
            context,
            capacity,
            parameters: resident.parameters,
            derivatives: resident.derivatives,
            optimizer_state: resident.optimizer_state,
            layer_parameters,
            layer_derivatives,
            outputs: resident.outputs,
            errors: resident.errors,
            staging: Staging::default(),
        })
    }

    fn upload(
        config: &NetworkConfig,
        context: &mut Context,
        allocated: &mut Vec<Buffer<f32>>,
        parameters: &[f32],
        state: &[f32],
    ) -> Result<Resident, DeviceError> {
        let capacity = context.sub_batch_capacity();
        let mut create = |context: &mut Context, len: usize| -> Result<Buffer<f32>, DeviceError> {
            let buffer = context.create_buffer(len)?;
            allocated.push(buffer);
            Ok(buffer)
        };

        let param_buffer = create(context, parameters.len())?;
        let derivatives = create(context, parameters.len())?;
        let optimizer_state = create(context, state.len())?;
        let mut outputs = Vec::with_capacity(config.layers().len());
        let mut errors = Vec::with_capacity(config.layers().len());
        for layer in config.layers() {
            outputs.push(create(context, layer.output_size() * capacity)?);
            errors.push(create(context, layer.output_size() * capacity)?);
        }

        context.enqueue_write(param_buffer, parameters)?;
        context.enqueue_write(optimizer_state, state)?;
        context.finish()?;
        Ok(Resident {
            parameters: param_buffer,
            derivatives,
            optimizer_state,
            outputs,
            errors,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Derivatives accumulated over the most recent batch.
    pub fn read_derivatives(&mut self) -> Result<Vec<f32>> {
        Ok(self.context.read_buffer(self.derivatives)?)
    }

    /// Sub-batches covering `start..end`, as `(offset, count)` pairs.
    fn chunks(&self, start: usize, end: usize) -> impl Iterator<Item = (usize, usize)> {
        let capacity = self.capacity;
        (start..end)
            .step_by(capacity)
            .map(move |offset| (offset, capacity.min(end - offset)))
    }

    fn stage_inputs(&mut self, inputs: &[f32]) -> Result<Buffer<f32>, DeviceError> {
        let buffer = Staging::reserve(&mut self.context, &mut self.staging.inputs, inputs.len())?;
        self.context.enqueue_write(buffer, inputs)?;
        Ok(buffer)
    }

    /// Enqueue a forward pass over `count` examples. The last layer writes to
    /// `destination` if one is given, otherwise to its activation buffer.
    fn enqueue_forward(
        &mut self,
        input: Buffer<f32>,
        destination: Option<Buffer<f32>>,
        count: usize,
    ) -> Result<(), DeviceError> {
        let last = self.config.layers().len() - 1;
        let mut input = input;
        for (i, layer) in self.config.layers().iter().enumerate() {
            let output = match destination {
                Some(destination) if i == last => destination,
                _ => self.outputs[i].sub_buffer(0, layer.output_size() * count)?,
            };
            layer.enqueue_forward(&mut self.context, input, self.layer_parameters[i], output, count);
            input = output;
        }
        Ok(())
    }

    /// Enqueue back propagation of the errors already in the last layer's
    /// error buffer, accumulating every layer's derivatives.
    fn enqueue_backward(&mut self, input: Buffer<f32>, count: usize) -> Result<(), DeviceError> {
        for (i, layer) in self.config.layers().iter().enumerate().rev() {
            let out_len = layer.output_size() * count;
            let in_len = layer.input_size() * count;
            let data = DeviceBackPropData {
                input: if i == 0 {
                    input
                } else {
                    self.outputs[i - 1].sub_buffer(0, in_len)?
                },
                output: self.outputs[i].sub_buffer(0, out_len)?,
                output_error: self.errors[i].sub_buffer(0, out_len)?,
                params: self.layer_parameters[i],
                count,
            };
            if i > 0 {
                let input_error = self.errors[i - 1].sub_buffer(0, in_len)?;
                layer.enqueue_back_propagate(&mut self.context, &data, input_error);
            }
            layer.enqueue_derivatives(&mut self.context, &data, self.layer_derivatives[i]);
        }
        Ok(())
    }

    fn last_output(&self, count: usize) -> Result<Buffer<f32>, DeviceError> {
        let last = self.outputs.len() - 1;
        self.outputs[last].sub_buffer(0, self.config.output_size() * count)
    }

    fn last_error(&self, count: usize) -> Result<Buffer<f32>, DeviceError> {
        let last = self.errors.len() - 1;
        self.errors[last].sub_buffer(0, self.config.output_size() * count)
    }

    /// On failure, discard the queued work and every staging buffer so that
    /// only the resident buffers remain.
    fn conclude<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            warn!(error = %e, "accelerator call failed, discarding queued commands");
            self.context.abort();
            if let Err(release) = self.staging.release(&mut self.context) {
                warn!(error = %release, "failed to release staging buffers");
            }
        }
        result
    }

    fn forward_staged(&mut self, inputs: &[f32], count: usize) -> Result<Vec<f32>> {
        let (in_size, out_size) = (self.config.input_size(), self.config.output_size());
        let staged = self.stage_inputs(inputs)?;
        let outputs = Staging::reserve(&mut self.context, &mut self.staging.outputs, out_size * count)?;
        for (offset, n) in self.chunks(0, count) {
            let input = staged.sub_buffer(offset * in_size, n * in_size)?;
            let destination = outputs.sub_buffer(offset * out_size, n * out_size)?;
            self.enqueue_forward(input, Some(destination), n)?;
        }
        Ok(self.context.read_buffer(outputs)?)
    }

    /// Classes of every example, left on the device.
    fn enqueue_classify(&mut self, inputs: &[f32], count: usize) -> Result<Buffer<u32>, DeviceError> {
        let (in_size, out_size) = (self.config.input_size(), self.config.output_size());
        let staged = self.stage_inputs(inputs)?;
        let classes = Staging::reserve(&mut self.context, &mut self.staging.classes, count)?;
        for (offset, n) in self.chunks(0, count) {
            self.enqueue_forward(staged.sub_buffer(offset * in_size, n * in_size)?, None, n)?;
            let output = self.last_output(n)?;
            self.context.enqueue_kernel(Kernel::Classify {
                output,
                classes: classes.sub_buffer(offset, n)?,
                size: out_size,
                count: n,
            });
        }
        Ok(classes)
    }

    fn test_values(&mut self, loss: &Loss, inputs: &[f32], targets: &[f32], count: usize) -> Result<f32> {
        let (in_size, out_size) = (self.config.input_size(), self.config.output_size());
        let staged = self.stage_inputs(inputs)?;
        let staged_targets = Staging::reserve(&mut self.context, &mut self.staging.targets, targets.len())?;
        self.context.enqueue_write(staged_targets, targets)?;
        let errors = Staging::reserve(&mut self.context, &mut self.staging.errors, count)?;
        for (offset, n) in self.chunks(0, count) {
            self.enqueue_forward(staged.sub_buffer(offset * in_size, n * in_size)?, None, n)?;
            let output = self.last_output(n)?;
            let target = staged_targets.sub_buffer(offset * out_size, n * out_size)?;
            loss.enqueue_total_error(&mut self.context, output, target, errors.sub_buffer(offset, n)?, out_size);
        }
        let errors = self.context.read_buffer(errors)?;
        let mut total = 0.;
        for e in errors {
            total += e;
        }
        Ok(total / count as f32)
    }

    fn test_labels(&mut self, inputs: &[f32], labels: &[u32], count: usize) -> Result<f32> {
        let classes = self.enqueue_classify(inputs, count)?;
        let classes = self.context.read_buffer(classes)?;
        let mut correct = 0.;
        for (class, label) in classes.iter().zip(labels) {
            correct += (class == label) as u8 as f32;
        }
        Ok(correct / count as f32)
    }

    fn train_staged(
        &mut self,
        inputs: &[f32],
        targets: TargetData<'_>,
        count: usize,
        epochs: usize,
    ) -> Result<()> {
        let config = Arc::clone(&self.config);
        let optimizer = config.optimizer().ok_or(ConfigError::MissingOptimizer)?;
        let (in_size, out_size) = (config.input_size(), config.output_size());
        let batch_size = config.batch_size();

        let staged = self.stage_inputs(inputs)?;
        let (staged_targets, staged_labels, loss) = match targets {
            TargetData::Values(values) => {
                let loss = config.loss().ok_or(ConfigError::MissingLoss)?;
                let buffer = Staging::reserve(&mut self.context, &mut self.staging.targets, values.len())?;
                self.context.enqueue_write(buffer, values)?;
                (Some(buffer), None, Some(loss))
            }
            TargetData::Labels(labels) => {
                let buffer = Staging::reserve(&mut self.context, &mut self.staging.labels, labels.len())?;
                self.context.enqueue_write(buffer, labels)?;
                (None, Some(buffer), None)
            }
        };

        for epoch in 0..epochs {
            for start in (0..count).step_by(batch_size) {
                let end = (start + batch_size).min(count);
                optimizer.enqueue_begin_batch(&mut self.context, self.derivatives);
                for (offset, n) in self.chunks(start, end) {
                    let input = staged.sub_buffer(offset * in_size, n * in_size)?;
                    self.enqueue_forward(input, None, n)?;

                    let (output, output_error) = (self.last_output(n)?, self.last_error(n)?);
                    match (staged_targets, staged_labels, loss) {
                        (Some(values), _, Some(loss)) => {
                            let target = values.sub_buffer(offset * out_size, n * out_size)?;
                            loss.enqueue_derivatives(&mut self.context, output, target, output_error);
                        }
                        (_, Some(labels), _) => self.context.enqueue_kernel(Kernel::LabelError {
                            output,
                            labels: labels.sub_buffer(offset, n)?,
                            output_error,
                            size: out_size,
                            count: n,
                        }),
                        _ => return Err(ConfigError::MissingLoss.into()),
                    }

                    self.enqueue_backward(input, n)?;
                }
                optimizer.enqueue_update(
                    &mut self.context,
                    self.parameters,
                    self.derivatives,
                    self.optimizer_state,
                    end - start,
                )?;
            }
            self.context.flush();
            debug!(epoch, "finished epoch");
        }
        self.context.finish()?;
        Ok(())
    }
}

impl Engine for DeviceEngine {
    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn forward(&mut self, inputs: &[f32], count: usize) -> Result<Vec<f32>> {
        check_inputs(&self.config, inputs, count)?;
        let result = self.forward_staged(inputs, count);
        self.conclude(result)
    }

    fn classify(&mut self, inputs: &[f32], count: usize) -> Result<Vec<u32>> {
        check_inputs(&self.config, inputs, count)?;
        let result = self
            .enqueue_classify(inputs, count)
            .and_then(|classes| self.context.read_buffer(classes))
            .map_err(Into::into);
        self.conclude(result)
    }

    fn test(&mut self, inputs: &[f32], targets: TargetData<'_>, count: usize) -> Result<f32> {
        if count == 0 {
            return Err(ConfigError::NoExamples.into());
        }
        check_inputs(&self.config, inputs, count)?;
        check_targets(&self.config, targets, count)?;
        let config = Arc::clone(&self.config);
        let result = match targets {
            TargetData::Values(values) => match config.loss() {
                Some(loss) => self.test_values(loss, inputs, values, count),
                None => Err(ConfigError::MissingLoss.into()),
            },
            TargetData::Labels(labels) => self.test_labels(inputs, labels, count),
        };
        self.conclude(result)
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
        let result = self.train_staged(inputs, targets, count, epochs);
        self.conclude(result)
    }

    fn read_parameters(&mut self) -> Result<Vec<f32>> {
        let result = self.context.read_buffer(self.parameters).map_err(Into::into);
        self.conclude(result)
    }

    fn write_parameters(&mut self, parameters: &[f32]) -> Result<()> {
        if parameters.len() != self.parameters.len() {
            return Err(ConfigError::ParameterCount {
                expected: self.parameters.len(),
                received: parameters.len(),
            }
            .into());
        }
        let result = self
            .context
            .enqueue_write(self.parameters, parameters)
            .and_then(|_| self.context.finish())
            .map_err(Into::into);
        self.conclude(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceOptions,
        layers::tests::check,
        loss::MeanSquared,
        network::{HostEngine, NetworkBuilder},
        optimizer::Adam,
    };
    use assert_matches::assert_matches;

    fn config() -> Arc<NetworkConfig> {
        let config = NetworkBuilder::new()
            .input_shape(2)
            .and_then(|b| b.dense(3))
            .and_then(|b| b.sigmoid())
            .and_then(|b| b.dense(2))
            .and_then(|b| b.batch_size(3))
            .unwrap()
            .loss(MeanSquared)
            .optimizer(Adam::new(0.05))
            .seed(7)
            .build()
            .unwrap();
        Arc::new(config)
    }

    fn engine(capacity: usize, memory_limit: Option<usize>) -> Result<DeviceEngine, DeviceError> {
        let context = Context::new(DeviceOptions {
            sub_batch_capacity: capacity,
            memory_limit,
            ..DeviceOptions::software()
        })?;
        DeviceEngine::new(config(), context)
    }

    const INPUTS: [f32; 10] = [0.1, 0.9, -0.4, 0.3, 0.7, -0.8, 0.0, 0.5, -1.0, -0.2];
    const TARGETS: [f32; 10] = [1., 0., 0., 1., 1., 1., 0., 0., 0.5, 0.5];

    #[test]
    fn starts_from_host_parameters() {
        let mut host = HostEngine::new(config());
        let mut device = engine(2, None).unwrap();
        assert_eq!(host.read_parameters().unwrap(), device.read_parameters().unwrap());
    }

    #[test]
    fn sub_batches_match_host() {
        let mut host = HostEngine::new(config());
        let mut device = engine(2, None).unwrap();

        host.train(&INPUTS, TargetData::Values(&TARGETS), 5, 3).unwrap();
        device.train(&INPUTS, TargetData::Values(&TARGETS), 5, 3).unwrap();

        let expected = host.read_parameters().unwrap();
        check(&expected, &device.read_parameters().unwrap(), 1e-5, "parameters");
        check(host.derivatives(), &device.read_derivatives().unwrap(), 1e-5, "derivatives");
        check(
            &host.forward(&INPUTS, 5).unwrap(),
            &device.forward(&INPUTS, 5).unwrap(),
            1e-5,
            "outputs",
        );
        // two logical batches per epoch
        assert_eq!(device.context().launches("adam_update"), 6);
        assert_eq!(device.context().launches("dense_forward"), 2 * 3 * 3 + 2 * 3);
    }

    #[test]
    fn labels_and_classes_match_host() {
        let mut host = HostEngine::new(config());
        let mut device = engine(4, None).unwrap();
        let labels = [0, 1, 1, 0, 1];

        host.train(&INPUTS, TargetData::Labels(&labels), 5, 2).unwrap();
        device.train(&INPUTS, TargetData::Labels(&labels), 5, 2).unwrap();

        assert_eq!(host.classify(&INPUTS, 5).unwrap(), device.classify(&INPUTS, 5).unwrap());
        let accuracy = device.test(&INPUTS, TargetData::Labels(&labels), 5).unwrap();
        assert_eq!(host.test(&INPUTS, TargetData::Labels(&labels), 5).unwrap(), accuracy);

        let error = device.test(&INPUTS, TargetData::Values(&TARGETS), 5).unwrap();
        let expected = host.test(&INPUTS, TargetData::Values(&TARGETS), 5).unwrap();
        assert!((error - expected).abs() < 1e-5);
    }

    #[test]
    fn staging_only_grows() {
        let mut device = engine(2, None).unwrap();
        device.forward(&INPUTS, 5).unwrap();
        let in_use = device.context().memory_in_use();

        device.forward(&INPUTS[..4], 2).unwrap();
        device.forward(&INPUTS, 5).unwrap();
        assert_eq!(device.context().memory_in_use(), in_use);

        let mut more = INPUTS.to_vec();
        more.extend_from_slice(&INPUTS);
        device.forward(&more, 10).unwrap();
        assert!(device.context().memory_in_use() > in_use);
    }

    #[test]
    fn failed_call_releases_staging() {
        let mut device = engine(2, Some(128)).unwrap();
        let in_use = device.context().memory_in_use();
        let live = device.context().live_buffers();
        let before = device.read_parameters().unwrap();

        // the staged inputs fit, the outputs do not
        let inputs = vec![0.5; 2 * 12];
        assert_matches!(
            device.forward(&inputs, 12),
            Err(crate::error::Error::Device(DeviceError::OutOfMemory { .. }))
        );
        assert_eq!(device.context().memory_in_use(), in_use);
        assert_eq!(device.context().live_buffers(), live);
        assert_eq!(device.context().pending(), 0);
        assert_eq!(device.read_parameters().unwrap(), before);

        // still usable afterwards
        assert_eq!(device.forward(&INPUTS[..4], 2).unwrap().len(), 4);
    }

    #[test]
    fn initialization_failure() {
        assert_matches!(engine(2, Some(8)), Err(DeviceError::OutOfMemory { .. }));
    }
}
