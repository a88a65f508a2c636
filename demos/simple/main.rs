use splitkit::{
    events::AnalyticsEvent, ClientConfig, Device, ExperimentConfig, ExperimentStatus,
    ExperimentVariant, FeatureFlag, Targeting,
};

pub fn main() {
    env_logger::init();

    let mut config = ClientConfig::in_memory();
    config.event_sink(|event: &AnalyticsEvent| {
        println!("event: {} {:?}", event.name, event.properties);
    });
    let client = config.to_client();

    client
        .registry()
        .create_experiment(
            ExperimentConfig::new(
                "checkout-button",
                "Checkout button color",
                vec![
                    ExperimentVariant::control("control", 50.0)
                        .with_config("color", "blue"),
                    ExperimentVariant::new("green", 50.0).with_config("color", "green"),
                ],
            )
            .with_status(ExperimentStatus::Running)
            .with_metrics(["purchase"]),
        )
        .unwrap();

    client
        .registry()
        .create_flag(
            FeatureFlag::new("new-header")
                .with_rollout(25.0)
                .with_targeting(Targeting::default().with_devices([Device::Desktop])),
        )
        .unwrap();

    let context = client.user_context();

    // Assigned once, then sticky for this user.
    let variant = client.get_variant("checkout-button", &context);
    let button = client.get_variant_config("checkout-button", &context);
    println!("user {} got variant {variant:?} ({button:?})", context.user_id);

    client.track_exposure("checkout-button", &context);
    client.track_conversion("checkout-button", "purchase", Some(129.0), &context);

    println!(
        "new-header enabled: {}",
        client.is_feature_enabled("new-header", &context)
    );
}
