mod common;

use accel_nn::{
    loss::MeanSquared, network::Backend, optimizer::GradientDescent, BackendKind, Context,
    DeviceError, DeviceOptions, Error, Network, NetworkBuilder, NetworkConfig, Tensor,
};
use assert_matches::assert_matches;
use common::uniform;

fn config() -> NetworkConfig {
    NetworkBuilder::new()
        .input_shape(2)
        .and_then(|b| b.dense(3))
        .and_then(|b| b.dense(1))
        .unwrap()
        .loss(MeanSquared)
        .optimizer(GradientDescent::new(0.1))
        .accelerate(true)
        .build()
        .unwrap()
}

fn network(memory_limit: usize) -> Network {
    let context = Context::new(DeviceOptions {
        sub_batch_capacity: 4,
        memory_limit: Some(memory_limit),
        ..DeviceOptions::software()
    })
    .unwrap();
    Network::with_context(config(), context)
}

fn context(network: &Network) -> &Context {
    match network.engine() {
        Backend::Device(engine) => engine.context(),
        Backend::Host(_) => panic!("expected the accelerator engine"),
    }
}

#[test]
fn falls_back_to_host() {
    let mut network = network(4);
    assert_eq!(network.backend(), BackendKind::Host);

    let mut reference = Network::new(config().with_backend(BackendKind::Host));
    assert_eq!(network.parameters().unwrap(), reference.parameters().unwrap());
}

#[test]
fn failed_training_leaves_engine_intact() {
    // 13 parameters and derivatives, 16 activations and 16 errors
    let mut network = network(68);
    assert_eq!(network.backend(), BackendKind::Accelerator);
    let in_use = context(&network).memory_in_use();
    let live = context(&network).live_buffers();
    let before = network.parameters().unwrap();

    // the staged inputs fit, the targets do not
    let inputs = Tensor::new([4, 2], uniform(8, -1., 1., 1)).unwrap();
    let targets = Tensor::new([4, 1], uniform(4, -1., 1., 2)).unwrap();
    assert_matches!(
        network.train(&inputs, &targets, 1),
        Err(Error::Device(DeviceError::OutOfMemory { .. }))
    );

    assert_eq!(context(&network).memory_in_use(), in_use);
    assert_eq!(context(&network).live_buffers(), live);
    assert_eq!(context(&network).pending(), 0);
    assert_eq!(network.parameters().unwrap(), before);

    let single = Tensor::new([1, 2], vec![0.5, -0.5]).unwrap();
    assert_eq!(network.forward(&single).unwrap().shape().dims(), &[1, 1]);
    // staging for two inputs and one output
    assert_eq!(context(&network).memory_in_use(), in_use + 3);
}
