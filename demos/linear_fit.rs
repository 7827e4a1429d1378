use accel_nn::{
    loss::MeanSquared, optimizer::GradientDescent, BackendKind, Network, NetworkBuilder, Tensor,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TRAIN: usize = 200;
const TEST: usize = 50;

fn data(count: usize, rng: &mut SmallRng) -> anyhow::Result<(Tensor<'static>, Tensor<'static>)> {
    let xs: Vec<f32> = (0..count).map(|_| rng.gen_range(-2., 2.)).collect();
    let ys = xs.iter().map(|x| 3. * x - 1.5).collect();
    Ok((Tensor::new([count, 1], xs)?, Tensor::new([count, 1], ys)?))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut rng = SmallRng::seed_from_u64(0);
    let (inputs, targets) = data(TRAIN, &mut rng)?;
    let (test_inputs, test_targets) = data(TEST, &mut rng)?;

    let config = NetworkBuilder::new()
        .input_shape(1)?
        .dense(1)?
        .batch_size(10)?
        .loss(MeanSquared)
        .optimizer(GradientDescent::new(0.1))
        .build()?;

    for backend in [BackendKind::Host, BackendKind::Accelerator] {
        let mut network = Network::new(config.with_backend(backend));
        network.train(&inputs, &targets, 100)?;
        let loss = network.test(&test_inputs, &test_targets)?;
        let parameters = network.parameters()?;
        info!(?backend, bias = parameters[0], weight = parameters[1], "fitted");
        println!("{:?}: held out mse {}", network.backend(), loss);
    }
    Ok(())
}
