use crate::{
    error::ConfigError,
    layers::{BasicLayer, DenseLayer, Layer, SigmoidLayer},
    loss::Loss,
    optimizer::BasicOptimizer,
    tensor::Shape,
};

use serde::{Deserialize, Serialize};

use std::{fs, path::Path};

/// Which engine should execute the network.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    #[default]
    Host,
    Accelerator,
}

/// Validated description of a network. Once built it is never mutated, the
/// engines only ever read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ConfigUnvalidated", try_from = "ConfigUnvalidated")]
pub struct NetworkConfig {
    input_shape: Shape,
    output_shape: Shape,
    layers: Vec<BasicLayer>,
    loss: Option<Loss>,
    optimizer: Option<BasicOptimizer>,
    batch_size: usize,
    backend: BackendKind,
    seed: u64,
}

impl NetworkConfig {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::new()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<NetworkConfig> {
        let s = fs::read_to_string(path)?;
        let config: NetworkConfig = serde_json::from_str(&s)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        fs::write(path, serde_json::to_string(&self)?)?;
        Ok(())
    }

    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    pub fn input_size(&self) -> usize {
        self.input_shape.size()
    }

    pub fn output_size(&self) -> usize {
        self.output_shape.size()
    }

    pub fn layers(&self) -> &[BasicLayer] {
        &self.layers
    }

    pub fn loss(&self) -> Option<&Loss> {
        self.loss.as_ref()
    }

    pub fn optimizer(&self) -> Option<&BasicOptimizer> {
        self.optimizer.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Sum of the parameter counts of every layer.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    /// The same topology executed by another backend.
    pub fn with_backend(&self, backend: BackendKind) -> NetworkConfig {
        NetworkConfig {
            backend,
            ..self.clone()
        }
    }
}

/// Fluent construction of a [NetworkConfig]. Each step that can violate the
/// topology validates immediately.
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    layers: Vec<BasicLayer>,
    loss: Option<Loss>,
    optimizer: Option<BasicOptimizer>,
    batch_size: usize,
    backend: BackendKind,
    seed: u64,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self {
            input_shape: None,
            output_shape: None,
            layers: Vec::new(),
            loss: None,
            optimizer: None,
            batch_size: 1,
            backend: BackendKind::Host,
            seed: 0,
        }
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn input_shape<S: Into<Shape>>(mut self, shape: S) -> Result<Self, ConfigError> {
        let shape = shape.into();
        if !self.layers.is_empty() {
            return Err(ConfigError::InputShapeAfterLayers);
        }
        if shape.rank() == 0 || shape.size() == 0 {
            return Err(ConfigError::ZeroInputShape);
        }
        self.output_shape = Some(shape.clone());
        self.input_shape = Some(shape);
        Ok(self)
    }

    /// Shape produced by the last layer, or the input shape if there are none yet.
    fn last_shape(&self) -> Result<&Shape, ConfigError> {
        self.output_shape.as_ref().ok_or(ConfigError::MissingInputShape)
    }

    /// Adds a dense layer with `size` outputs.
    pub fn dense(self, size: usize) -> Result<Self, ConfigError> {
        let in_size = self.last_shape()?.size();
        let layer = DenseLayer::new(in_size, size)?;
        self.layer(layer)
    }

    /// Adds an elementwise sigmoid.
    pub fn sigmoid(self) -> Result<Self, ConfigError> {
        let size = self.last_shape()?.size();
        self.layer(SigmoidLayer::new(size))
    }

    /// Adds an already constructed layer, checking that it fits the previous one.
    pub fn layer<L: Into<BasicLayer>>(mut self, layer: L) -> Result<Self, ConfigError> {
        let layer = layer.into();
        let shape = self.last_shape()?;
        if layer.input_size() != shape.size() {
            return Err(ConfigError::Incompatible {
                index: self.layers.len(),
                received_input: shape.size(),
                expected_input: layer.input_size(),
            });
        }
        if layer.output_size() == 0 {
            return Err(ConfigError::ZeroOutputSize);
        }
        self.output_shape = Some(layer.output_shape(shape));
        self.layers.push(layer);
        Ok(self)
    }

    pub fn loss<L: Into<Loss>>(mut self, loss: L) -> Self {
        self.loss = Some(loss.into());
        self
    }

    pub fn optimizer<O: Into<BasicOptimizer>>(mut self, optimizer: O) -> Self {
        self.optimizer = Some(optimizer.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Request the accelerator backend.
    pub fn accelerate(mut self, enabled: bool) -> Self {
        self.backend = if enabled {
            BackendKind::Accelerator
        } else {
            BackendKind::Host
        };
        self
    }

    /// Seed for parameter initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let input_shape = self.input_shape.ok_or(ConfigError::MissingInputShape)?;
        let output_shape = self.output_shape.ok_or(ConfigError::MissingInputShape)?;
        if self.layers.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(NetworkConfig {
            input_shape,
            output_shape,
            layers: self.layers,
            loss: self.loss,
            optimizer: self.optimizer,
            batch_size: self.batch_size,
            backend: self.backend,
            seed: self.seed,
        })
    }
}

/// Serialized form of [NetworkConfig]. Deserialization goes through the
/// builder so a hand edited file cannot produce an invalid topology.
#[derive(Serialize, Deserialize)]
struct ConfigUnvalidated {
    input_shape: Shape,
    layers: Vec<BasicLayer>,
    #[serde(default)]
    loss: Option<Loss>,
    #[serde(default)]
    optimizer: Option<BasicOptimizer>,
    batch_size: usize,
    #[serde(default)]
    backend: BackendKind,
    #[serde(default)]
    seed: u64,
}

impl From<NetworkConfig> for ConfigUnvalidated {
    fn from(config: NetworkConfig) -> Self {
        ConfigUnvalidated {
            input_shape: config.input_shape,
            layers: config.layers,
            loss: config.loss,
            optimizer: config.optimizer,
            batch_size: config.batch_size,
            backend: config.backend,
            seed: config.seed,
        }
    }
}

impl TryFrom<ConfigUnvalidated> for NetworkConfig {
    type Error = ConfigError;

    fn try_from(value: ConfigUnvalidated) -> Result<Self, Self::Error> {
        let mut builder = NetworkBuilder::new()
            .input_shape(value.input_shape)?
            .batch_size(value.batch_size)?
            .seed(value.seed)
            .accelerate(value.backend == BackendKind::Accelerator);
        for layer in value.layers {
            builder = builder.layer(layer)?;
        }
        if let Some(loss) = value.loss {
            builder = builder.loss(loss);
        }
        if let Some(optimizer) = value.optimizer {
            builder = builder.optimizer(optimizer);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loss::MeanSquared, optimizer::Adam};
    use assert_matches::assert_matches;

    #[test]
    fn builder_errors() {
        assert_matches!(NetworkBuilder::new().input_shape([0]), Err(ConfigError::ZeroInputShape));
        assert_matches!(NetworkBuilder::new().dense(3), Err(ConfigError::MissingInputShape));
        assert_matches!(
            NetworkBuilder::new().input_shape(2).and_then(|b| b.dense(0)),
            Err(ConfigError::ZeroOutputSize)
        );
        assert_matches!(
            NetworkBuilder::new()
                .input_shape(2)
                .and_then(|b| b.dense(3))
                .and_then(|b| b.input_shape(4)),
            Err(ConfigError::InputShapeAfterLayers)
        );
        assert_matches!(
            NetworkBuilder::new().input_shape(2).and_then(|b| b.build()),
            Err(ConfigError::Empty)
        );
        assert_matches!(
            NetworkBuilder::new().input_shape(2).and_then(|b| b.batch_size(0)),
            Err(ConfigError::ZeroBatchSize)
        );
        assert_matches!(
            NetworkBuilder::new()
                .input_shape(2)
                .and_then(|b| b.layer(DenseLayer::new(3, 1).unwrap())),
            Err(ConfigError::Incompatible {
                index: 0,
                received_input: 2,
                expected_input: 3
            })
        );
    }

    #[test]
    fn output_shapes() {
        let config = NetworkBuilder::new()
            .input_shape([4, 4])
            .and_then(|b| b.sigmoid())
            .and_then(|b| b.build())
            .unwrap();
        assert_eq!(config.output_shape(), &Shape::from([4, 4]));

        let config = NetworkBuilder::new()
            .input_shape([4, 4])
            .and_then(|b| b.dense(10))
            .and_then(|b| b.sigmoid())
            .and_then(|b| b.build())
            .unwrap();
        assert_eq!(config.output_shape(), &Shape::from([10]));
        assert_eq!(config.parameter_count(), 17 * 10);
    }

    #[test]
    fn serde_round_trip_validates() {
        let config = NetworkBuilder::new()
            .input_shape(3)
            .and_then(|b| b.dense(5))
            .and_then(|b| b.sigmoid())
            .and_then(|b| b.batch_size(4))
            .unwrap()
            .loss(MeanSquared)
            .optimizer(Adam::new(0.01))
            .accelerate(true)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);

        let broken = json.replace("\"in_size\":3", "\"in_size\":4");
        assert!(serde_json::from_str::<NetworkConfig>(&broken).is_err());
    }

    #[test]
    fn backend_defaults_to_host() {
        assert_eq!(BackendKind::default(), BackendKind::Host);

        let config = NetworkBuilder::new()
            .input_shape(2)
            .and_then(|b| b.dense(1))
            .and_then(|b| b.build())
            .unwrap();
        assert_eq!(config.backend(), BackendKind::Host);

        // configs saved without a backend load onto the host
        let json = serde_json::to_string(&config).unwrap();
        let stripped = json.replace(",\"backend\":\"Host\"", "");
        assert_ne!(json, stripped);
        let loaded: NetworkConfig = serde_json::from_str(&stripped).unwrap();
        assert_eq!(loaded.backend(), BackendKind::Host);
    }
}
