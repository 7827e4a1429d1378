use accel_nn::{
    dataset::MnistData, loss::MeanSquared, optimizer::Adam, Network, NetworkBuilder,
};
use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::{env, path::PathBuf, time::Instant};

/// Decoded once from the IDX files, then reused.
const CACHE: &str = "mnist.bin";

fn load(dir: PathBuf) -> anyhow::Result<MnistData> {
    let cache = dir.join(CACHE);
    if cache.exists() {
        return MnistData::load_cache(&cache);
    }
    let data = MnistData::load(&dir).context("Could not open mnist files")?;
    data.dump_cache(&cache)?;
    Ok(data)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| "data".into());
    let data = load(dir)?;

    let config = NetworkBuilder::new()
        .input_shape(data.train_images.shape().slice())?
        .dense(32)?
        .sigmoid()?
        .dense(10)?
        .sigmoid()?
        .batch_size(32)?
        .loss(MeanSquared)
        .optimizer(Adam::new(0.01))
        .accelerate(true)
        .build()?;
    let mut network = Network::new(config);
    info!(backend = ?network.backend(), "training");

    let start = Instant::now();
    network.train(&data.train_images, &data.train_labels, 1)?;
    println!("Trained in {:.2} seconds", start.elapsed().as_secs_f32());

    let count = data.test_images.length().min(1000);
    let images = data.test_images.section(0, count)?;
    let labels = data.test_labels.section(0, count)?;
    println!("accuracy: {}", network.test(&images, &labels)?);
    Ok(())
}
