mod common;

use accel_nn::{
    loss::MeanSquared,
    network::Backend,
    optimizer::{Adam, BasicOptimizer, GradientDescent},
    BackendKind, Context, DeviceOptions, Network, NetworkBuilder, NetworkConfig, Tensor,
};
use common::{check, uniform};

const COUNT: usize = 13;
const CAPACITY: usize = 4;
const EPOCHS: usize = 3;
const TOLERANCE: f32 = 1e-4;

fn config(batch_size: usize, optimizer: BasicOptimizer) -> NetworkConfig {
    NetworkBuilder::new()
        .input_shape(3)
        .and_then(|b| b.dense(4))
        .and_then(|b| b.sigmoid())
        .and_then(|b| b.dense(2))
        .and_then(|b| b.batch_size(batch_size))
        .unwrap()
        .loss(MeanSquared)
        .optimizer(optimizer)
        .seed(11)
        .build()
        .unwrap()
}

fn pair(config: NetworkConfig) -> (Network, Network) {
    let context = Context::new(DeviceOptions {
        sub_batch_capacity: CAPACITY,
        ..DeviceOptions::software()
    })
    .unwrap();
    let host = Network::new(config.with_backend(BackendKind::Host));
    let device = Network::with_context(config.with_backend(BackendKind::Accelerator), context);
    assert_eq!(host.backend(), BackendKind::Host);
    assert_eq!(device.backend(), BackendKind::Accelerator);
    (host, device)
}

fn derivatives(network: &mut Network) -> Vec<f32> {
    match network.engine_mut() {
        Backend::Host(engine) => engine.derivatives().to_vec(),
        Backend::Device(engine) => engine.read_derivatives().unwrap(),
    }
}

fn optimizers() -> Vec<BasicOptimizer> {
    vec![GradientDescent::new(0.5).into(), Adam::new(0.02).into()]
}

#[test]
fn value_training_matches() {
    let inputs = Tensor::new([COUNT, 3], uniform(COUNT * 3, -1., 1., 5)).unwrap();
    let targets = Tensor::new([COUNT, 2], uniform(COUNT * 2, 0., 1., 6)).unwrap();

    for optimizer in optimizers() {
        for batch_size in [3, 4, 5, 9] {
            let (mut host, mut device) = pair(config(batch_size, optimizer.clone()));
            check(
                &host.parameters().unwrap(),
                &device.parameters().unwrap(),
                TOLERANCE,
                "initial parameters",
            );

            host.train(&inputs, &targets, EPOCHS).unwrap();
            device.train(&inputs, &targets, EPOCHS).unwrap();

            let id = format!("parameters (batch {}, {:?})", batch_size, optimizer);
            check(&host.parameters().unwrap(), &device.parameters().unwrap(), TOLERANCE, &id);
            check(
                &derivatives(&mut host),
                &derivatives(&mut device),
                TOLERANCE,
                "derivatives",
            );
            check(
                host.forward(&inputs).unwrap().as_slice(),
                device.forward(&inputs).unwrap().as_slice(),
                TOLERANCE,
                "outputs",
            );
            let (host_loss, device_loss) = (
                host.test(&inputs, &targets).unwrap(),
                device.test(&inputs, &targets).unwrap(),
            );
            check(&[host_loss], &[device_loss], TOLERANCE, "loss");
        }
    }
}

#[test]
fn optimizer_steps_once_per_logical_batch() {
    let inputs = Tensor::new([COUNT, 3], uniform(COUNT * 3, -1., 1., 7)).unwrap();
    let targets = Tensor::new([COUNT, 2], uniform(COUNT * 2, 0., 1., 8)).unwrap();

    for batch_size in [3, 4, 5, 9] {
        let (_, mut device) = pair(config(batch_size, Adam::new(0.01).into()));
        device.train(&inputs, &targets, EPOCHS).unwrap();

        let batches = (COUNT + batch_size - 1) / batch_size;
        match device.engine() {
            Backend::Device(engine) => {
                assert_eq!(engine.context().launches("adam_update"), batches * EPOCHS);
                assert_eq!(engine.context().launches("adam_update_betas"), batches * EPOCHS);
                assert_eq!(engine.context().launches("fill"), batches * EPOCHS);
            }
            Backend::Host(_) => panic!("expected the accelerator engine"),
        }
    }
}

#[test]
fn label_training_matches() {
    let inputs = Tensor::new([COUNT, 3], uniform(COUNT * 3, -1., 1., 9)).unwrap();
    let labels = Tensor::new([COUNT], (0..COUNT as u32).map(|i| i % 2).collect()).unwrap();

    for optimizer in optimizers() {
        let (mut host, mut device) = pair(config(5, optimizer));
        host.train(&inputs, &labels, EPOCHS).unwrap();
        device.train(&inputs, &labels, EPOCHS).unwrap();

        check(
            &host.parameters().unwrap(),
            &device.parameters().unwrap(),
            TOLERANCE,
            "parameters",
        );
        assert_eq!(
            host.classify(&inputs).unwrap().as_slice(),
            device.classify(&inputs).unwrap().as_slice()
        );
        assert_eq!(
            host.test(&inputs, &labels).unwrap(),
            device.test(&inputs, &labels).unwrap()
        );
    }
}

#[test]
fn written_parameters_are_used() {
    let (mut host, mut device) = pair(config(4, GradientDescent::new(0.1).into()));
    let parameters = uniform(host.config().parameter_count(), -0.5, 0.5, 10);
    host.set_parameters(&parameters).unwrap();
    device.set_parameters(&parameters).unwrap();
    assert_eq!(device.parameters().unwrap(), parameters);

    let inputs = Tensor::new([COUNT, 3], uniform(COUNT * 3, -1., 1., 11)).unwrap();
    check(
        host.forward(&inputs).unwrap().as_slice(),
        device.forward(&inputs).unwrap().as_slice(),
        TOLERANCE,
        "outputs",
    );
    assert!(device.set_parameters(&parameters[1..]).is_err());
}
