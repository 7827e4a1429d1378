use thiserror::Error;

/// Violations of the network topology or of a call's input contract.
/// These are raised where the violation happens and are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("the input shape must have a non-zero size")]
    ZeroInputShape,
    #[error("the input shape must be set before any layers are added")]
    InputShapeAfterLayers,
    #[error("a layer was added before the input shape was set")]
    MissingInputShape,
    #[error("layer output size must be greater than zero")]
    ZeroOutputSize,
    #[error("the network must have at least a single layer, but it was empty")]
    Empty,
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error(
        "layer {index} is incompatible with the previous layer: expected input length of {expected_input} but received {received_input}"
    )]
    Incompatible {
        index: usize,
        received_input: usize,
        expected_input: usize,
    },
    #[error("a loss function is required for real-valued targets")]
    MissingLoss,
    #[error("an optimizer is required for training")]
    MissingOptimizer,
    #[error("input tensors must have at least two dimensions, received rank {0}")]
    InputRank(usize),
    #[error("input shape {received:?} does not match the network input shape {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        received: Vec<usize>,
    },
    #[error("target shape {received:?} does not match the network output shape {expected:?}")]
    TargetShape {
        expected: Vec<usize>,
        received: Vec<usize>,
    },
    #[error("label tensors must be one dimensional, received rank {0}")]
    LabelRank(usize),
    #[error("received {inputs} inputs but {targets} targets")]
    LengthMismatch { inputs: usize, targets: usize },
    #[error("label {label} at index {index} is out of range for {classes} classes")]
    LabelOutOfRange {
        index: usize,
        label: u32,
        classes: usize,
    },
    #[error("shape {shape:?} describes {expected} elements but {received} were provided")]
    TensorSize {
        shape: Vec<usize>,
        expected: usize,
        received: usize,
    },
    #[error("section {start}..{end} is out of bounds for a tensor of length {length}")]
    Section {
        start: usize,
        end: usize,
        length: usize,
    },
    #[error("expected {expected} parameters but received {received}")]
    ParameterCount { expected: usize, received: usize },
    #[error("at least one example is required to evaluate the network")]
    NoExamples,
}

/// Failures of the accelerator runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("invalid device options: {0}")]
    InvalidOptions(String),
    #[error("out of device memory: requested {requested} elements with {in_use} of {limit} in use")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
    #[error("buffer {0} does not refer to a live allocation")]
    InvalidBuffer(usize),
    #[error("buffer {0} is used as an output and another argument of the same command")]
    Aliased(usize),
    #[error("only whole allocations can be released, buffer {0} is a sub-buffer")]
    ReleaseSubBuffer(usize),
    #[error("region of {size} elements at offset {offset} exceeds an allocation of {len} elements")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
    #[error("buffer {0} holds a different element type")]
    TypeMismatch(usize),
    #[error("kernel {kernel} rejected its arguments: {reason}")]
    InvalidArguments {
        kernel: &'static str,
        reason: String,
    },
    #[error("no accelerator device is available: {0}")]
    Unavailable(String),
    #[error("failed to build the device program: {0}")]
    Build(String),
    #[error("device runtime error: {0}")]
    Runtime(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
