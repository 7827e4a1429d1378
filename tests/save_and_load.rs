use accel_nn::{
    loss::MeanSquared, optimizer::Adam, Network, NetworkBuilder, NetworkConfig, Tensor,
};

#[test]
fn save_and_load() -> anyhow::Result<()> {
    let config = NetworkBuilder::new()
        .input_shape([2, 3])?
        .dense(5)?
        .sigmoid()?
        .dense(2)?
        .batch_size(8)?
        .loss(MeanSquared)
        .optimizer(Adam::new(0.01))
        .seed(42)
        .build()?;

    let path = std::env::temp_dir().join(format!("accel-nn-config-{}.json", std::process::id()));
    config.save(&path)?;
    let loaded = NetworkConfig::from_file(&path)?;
    std::fs::remove_file(&path)?;
    assert_eq!(config, loaded);

    let input = Tensor::new([1, 2, 3], vec![1., 2., 3., 4., 5., 6.])?;
    let correct = Network::new(config).forward(&input)?;
    let prediction = Network::new(loaded).forward(&input)?;
    assert_eq!(
        correct.as_slice(),
        prediction.as_slice(),
        "Network structure damaged during saving."
    );
    Ok(())
}

#[test]
fn invalid_file_is_rejected() {
    let path = std::env::temp_dir().join(format!("accel-nn-broken-{}.json", std::process::id()));
    std::fs::write(&path, r#"{"input_shape":[2],"layers":[{"Dense":{"in_size":3,"size":1}}],"batch_size":1}"#)
        .unwrap();
    assert!(NetworkConfig::from_file(&path).is_err());
    std::fs::remove_file(&path).unwrap();
    assert!(NetworkConfig::from_file(&path).is_err());
}
