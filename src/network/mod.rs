pub mod accelerator;
pub mod construction;
pub mod host;

pub use self::accelerator::DeviceEngine;
pub use self::construction::{BackendKind, NetworkBuilder, NetworkConfig};
pub use self::host::HostEngine;

use crate::{
    device::{Context, DeviceOptions},
    error::{ConfigError, Result},
    initializer::UniformInit,
    layers::Layer,
    storage::{Allocator, Handle},
    tensor::Tensor,
};

use enum_dispatch::enum_dispatch;
use tracing::warn;

use std::sync::Arc;

/// Flat target data handed to an engine, one row per example.
#[derive(Debug, Clone, Copy)]
pub enum TargetData<'a> {
    Values(&'a [f32]),
    Labels(&'a [u32]),
}

/// Targets of a `test` or `train` call.
#[derive(Debug, Clone, Copy)]
pub enum Targets<'t, 'a> {
    /// Real valued targets shaped `[count, output...]`.
    Values(&'t Tensor<'a, f32>),
    /// Class indices shaped `[count]`.
    Labels(&'t Tensor<'a, u32>),
}

impl<'t, 'a> From<&'t Tensor<'a, f32>> for Targets<'t, 'a> {
    fn from(tensor: &'t Tensor<'a, f32>) -> Self {
        Targets::Values(tensor)
    }
}

impl<'t, 'a> From<&'t Tensor<'a, u32>> for Targets<'t, 'a> {
    fn from(tensor: &'t Tensor<'a, u32>) -> Self {
        Targets::Labels(tensor)
    }
}

/// Operations every execution engine provides. Engines are not reentrant,
/// each call runs to completion before the next one starts.
#[enum_dispatch]
pub trait Engine {
    fn config(&self) -> &NetworkConfig;

    /// Outputs of the last layer, `count` rows of the output size.
    fn forward(&mut self, inputs: &[f32], count: usize) -> Result<Vec<f32>>;

    /// Index of the largest output of every example.
    fn classify(&mut self, inputs: &[f32], count: usize) -> Result<Vec<u32>>;

    /// Mean aggregate loss for value targets, accuracy for labels.
    fn test(&mut self, inputs: &[f32], targets: TargetData<'_>, count: usize) -> Result<f32>;

    fn train(
        &mut self,
        inputs: &[f32],
        targets: TargetData<'_>,
        count: usize,
        epochs: usize,
    ) -> Result<()>;

    /// A copy of every parameter, in layer order.
    fn read_parameters(&mut self) -> Result<Vec<f32>>;

    fn write_parameters(&mut self, parameters: &[f32]) -> Result<()>;
}

#[enum_dispatch(Engine)]
#[derive(Debug)]
pub enum Backend {
    Host(HostEngine),
    Device(DeviceEngine),
}

/// Lay out the parameters of every layer and fill them from the config seed.
/// Both engines start from these values.
pub(crate) fn initial_parameters(config: &NetworkConfig) -> (Vec<Handle>, Vec<f32>) {
    let mut alloc = Allocator::new();
    let handles: Vec<Handle> = config
        .layers()
        .iter()
        .map(|l| alloc.allocate(l.parameter_count()))
        .collect();
    let mut storage = alloc.finish();
    let mut init = UniformInit::new(config.seed());
    for (layer, handle) in config.layers().iter().zip(&handles) {
        layer.initialize_parameters(storage.get_mut(*handle), &mut init);
    }
    (handles, storage.raw().to_vec())
}

/// Layout of the per layer activation (and error) regions for `rows` examples.
pub(crate) fn activation_layout(config: &NetworkConfig, rows: usize) -> (Allocator, Vec<Handle>) {
    let mut alloc = Allocator::new();
    let handles = config
        .layers()
        .iter()
        .map(|l| alloc.allocate(l.output_size() * rows))
        .collect();
    (alloc, handles)
}

/// Length checks shared by both engines.
pub(crate) fn check_inputs(config: &NetworkConfig, inputs: &[f32], count: usize) -> Result<(), ConfigError> {
    let expected = config.input_size() * count;
    if inputs.len() != expected {
        return Err(ConfigError::TensorSize {
            shape: config.input_shape().with_length(count).dims().to_vec(),
            expected,
            received: inputs.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_targets(config: &NetworkConfig, targets: TargetData<'_>, count: usize) -> Result<(), ConfigError> {
    match targets {
        TargetData::Values(values) => {
            config.loss().ok_or(ConfigError::MissingLoss)?;
            let expected = config.output_size() * count;
            if values.len() != expected {
                return Err(ConfigError::TensorSize {
                    shape: config.output_shape().with_length(count).dims().to_vec(),
                    expected,
                    received: values.len(),
                });
            }
        }
        TargetData::Labels(labels) => {
            if labels.len() != count {
                return Err(ConfigError::LengthMismatch {
                    inputs: count,
                    targets: labels.len(),
                });
            }
            let classes = config.output_size();
            if let Some((index, label)) = labels
                .iter()
                .enumerate()
                .find(|(_, l)| **l as usize >= classes)
            {
                return Err(ConfigError::LabelOutOfRange {
                    index,
                    label: *label,
                    classes,
                });
            }
        }
    }
    Ok(())
}

/// A network bound to an execution engine.
#[derive(Debug)]
pub struct Network {
    config: Arc<NetworkConfig>,
    backend: Backend,
}

impl Network {
    /// Builds the engine the config asks for on the default device. If the
    /// accelerator cannot be initialized the network runs on the host instead.
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_options(config, DeviceOptions::default())
    }

    /// Same as [new](Self::new), creating the accelerator context from `options`.
    pub fn with_options(config: NetworkConfig, options: DeviceOptions) -> Self {
        match config.backend() {
            BackendKind::Host => Self::host(config),
            BackendKind::Accelerator => match Context::new(options) {
                Ok(context) => Self::with_context(config, context),
                Err(e) => {
                    warn!(error = %e, "failed to create accelerator context, falling back to host");
                    Self::host(config)
                }
            },
        }
    }

    /// Runs the network on the provided accelerator context, falling back to
    /// the host if the engine cannot be initialized on it.
    pub fn with_context(config: NetworkConfig, context: Context) -> Self {
        let config = Arc::new(config);
        let backend = match DeviceEngine::new(Arc::clone(&config), context) {
            Ok(engine) => Backend::Device(engine),
            Err(e) => {
                warn!(error = %e, "failed to initialize accelerator engine, falling back to host");
                Backend::Host(HostEngine::new(Arc::clone(&config)))
            }
        };
        Self { config, backend }
    }

    fn host(config: NetworkConfig) -> Self {
        let config = Arc::new(config);
        let backend = Backend::Host(HostEngine::new(Arc::clone(&config)));
        Self { config, backend }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The backend actually executing the network.
    pub fn backend(&self) -> BackendKind {
        match self.backend {
            Backend::Host(_) => BackendKind::Host,
            Backend::Device(_) => BackendKind::Accelerator,
        }
    }

    pub fn engine(&self) -> &Backend {
        &self.backend
    }

    pub fn engine_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Checks the inputs and returns the example count.
    fn check_input_shape(&self, inputs: &Tensor<'_, f32>) -> Result<usize, ConfigError> {
        let shape = inputs.shape();
        if shape.rank() < 2 {
            return Err(ConfigError::InputRank(shape.rank()));
        }
        if &shape.slice() != self.config.input_shape() {
            return Err(ConfigError::InputShape {
                expected: self.config.input_shape().dims().to_vec(),
                received: shape.slice().dims().to_vec(),
            });
        }
        Ok(inputs.length())
    }

    fn check_target_shape<'t>(&self, targets: Targets<'t, '_>, count: usize) -> Result<TargetData<'t>, ConfigError> {
        match targets {
            Targets::Values(values) => {
                let shape = values.shape();
                if shape.rank() < 1 || &shape.slice() != self.config.output_shape() {
                    return Err(ConfigError::TargetShape {
                        expected: self.config.output_shape().dims().to_vec(),
                        received: shape.slice().dims().to_vec(),
                    });
                }
                if values.length() != count {
                    return Err(ConfigError::LengthMismatch {
                        inputs: count,
                        targets: values.length(),
                    });
                }
                Ok(TargetData::Values(values.as_slice()))
            }
            Targets::Labels(labels) => {
                if labels.shape().rank() != 1 {
                    return Err(ConfigError::LabelRank(labels.shape().rank()));
                }
                Ok(TargetData::Labels(labels.as_slice()))
            }
        }
    }

    pub fn forward(&mut self, inputs: &Tensor<'_, f32>) -> Result<Tensor<'static, f32>> {
        let count = self.check_input_shape(inputs)?;
        let output = self.backend.forward(inputs.as_slice(), count)?;
        Ok(Tensor::new(self.config.output_shape().with_length(count), output)?)
    }

    pub fn classify(&mut self, inputs: &Tensor<'_, f32>) -> Result<Tensor<'static, u32>> {
        let count = self.check_input_shape(inputs)?;
        let classes = self.backend.classify(inputs.as_slice(), count)?;
        Ok(Tensor::new([count], classes)?)
    }

    /// Mean loss against value targets, or accuracy against labels.
    pub fn test<'t, 'a: 't, T>(&mut self, inputs: &Tensor<'_, f32>, targets: T) -> Result<f32>
    where
        T: Into<Targets<'t, 'a>>,
    {
        let count = self.check_input_shape(inputs)?;
        let targets = self.check_target_shape(targets.into(), count)?;
        self.backend.test(inputs.as_slice(), targets, count)
    }

    pub fn train<'t, 'a: 't, T>(&mut self, inputs: &Tensor<'_, f32>, targets: T, epochs: usize) -> Result<()>
    where
        T: Into<Targets<'t, 'a>>,
    {
        let count = self.check_input_shape(inputs)?;
        let targets = self.check_target_shape(targets.into(), count)?;
        self.backend.train(inputs.as_slice(), targets, count, epochs)
    }

    pub fn parameters(&mut self) -> Result<Vec<f32>> {
        self.backend.read_parameters()
    }

    pub fn set_parameters(&mut self, parameters: &[f32]) -> Result<()> {
        self.backend.write_parameters(parameters)
    }
}
