//! Feed-forward network training on the host or on an accelerator, with both
//! engines producing the same results for the same configuration.

pub mod dataset;
pub mod device;
pub mod error;
pub mod helpers;
pub mod initializer;
pub mod layers;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod storage;
pub mod tensor;

pub use device::{Context, DeviceKind, DeviceOptions};
pub use error::{ConfigError, DeviceError, Error, Result};
pub use network::{BackendKind, Engine, Network, NetworkBuilder, NetworkConfig, Targets};
pub use tensor::{Shape, Tensor};
