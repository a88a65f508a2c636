use std::sync::Arc;

use splitkit::{
    events::ASSIGNMENT_EVENT,
    sharder::{bucket, RollingHashSharder},
    Client, ClientConfig, Device, Error, ExperimentConfig, ExperimentStatus, ExperimentVariant,
    FileStorage, Registry, Targeting, UserContext, ValidationError,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn experiment(id: &str, traffic_allocation: f64) -> ExperimentConfig {
    ExperimentConfig::new(
        id,
        "Checkout button",
        vec![
            ExperimentVariant::control("control", 50.0),
            ExperimentVariant::new("treatment", 50.0),
        ],
    )
    .with_status(ExperimentStatus::Running)
    .with_traffic_allocation(traffic_allocation)
}

fn client_with(experiment: ExperimentConfig) -> Client {
    let client = ClientConfig::in_memory().to_client();
    client.registry().create_experiment(experiment).unwrap();
    client
}

fn user(i: usize) -> UserContext {
    UserContext::new(format!("user-{i}"), "session")
}

#[test]
fn assignment_is_deterministic() {
    init();

    for _ in 0..10 {
        let client = client_with(experiment("e1", 100.0));
        for _ in 0..100 {
            assert_eq!(
                client
                    .get_variant("e1", &UserContext::new("u1", "s1"))
                    .as_deref(),
                Some("control")
            );
        }
    }
}

#[test]
fn buckets_are_evenly_distributed() {
    const USERS: usize = 100_000;

    let sharder = RollingHashSharder;
    let mut control = 0;
    let mut histogram = [0usize; 10];
    for i in 0..USERS {
        let user_id = format!("user-{i}");
        if bucket(&sharder, &user_id, "checkout_variant") < 50 {
            control += 1;
        }
        histogram[bucket(&sharder, &user_id, "checkout") as usize / 10] += 1;
    }

    let share = control as f64 / USERS as f64;
    assert!((0.47..=0.53).contains(&share), "control share {share}");
    for count in histogram {
        let share = count as f64 / USERS as f64;
        assert!((0.07..=0.13).contains(&share), "decile share {share}");
    }
}

#[test]
fn variants_follow_allocation() {
    init();
    let client = client_with(experiment("e1", 100.0));

    let control = (0..1000)
        .filter(|&i| client.get_variant("e1", &user(i)).as_deref() == Some("control"))
        .count();
    assert!((400..=600).contains(&control), "control {control}");
}

#[test]
fn uneven_split_follows_allocation() {
    const USERS: usize = 20_000;
    // Each client persists its whole assignment document on every assignment, so users are
    // spread over many short-lived clients.
    const USERS_PER_CLIENT: usize = 200;

    let split = ExperimentConfig::new(
        "split",
        "Three-way split",
        vec![
            ExperimentVariant::control("a", 20.0),
            ExperimentVariant::new("b", 30.0),
            ExperimentVariant::new("c", 50.0),
        ],
    )
    .with_status(ExperimentStatus::Running);

    let mut counts = [0usize; 3];
    for chunk in 0..USERS / USERS_PER_CLIENT {
        let mut config = ClientConfig::in_memory();
        config.max_stored_events(1);
        let client = config.to_client();
        client.registry().create_experiment(split.clone()).unwrap();

        for i in chunk * USERS_PER_CLIENT..(chunk + 1) * USERS_PER_CLIENT {
            match client.get_variant("split", &user(i)).as_deref() {
                Some("a") => counts[0] += 1,
                Some("b") => counts[1] += 1,
                Some("c") => counts[2] += 1,
                other => panic!("unexpected variant {other:?}"),
            }
        }
    }

    for (count, expected) in counts.into_iter().zip([0.20, 0.30, 0.50]) {
        let share = count as f64 / USERS as f64;
        assert!(
            (share - expected).abs() <= 0.02,
            "share {share}, expected {expected}"
        );
    }
}

#[test]
fn zero_traffic_assigns_nobody() {
    init();
    let client = client_with(experiment("e1", 0.0));

    for i in 0..500 {
        assert_eq!(client.get_variant("e1", &user(i)), None);
    }
    assert!(client.tracker().events().is_empty());
}

#[test]
fn full_traffic_assigns_everybody() {
    init();
    let client = client_with(experiment("e1", 100.0));

    for i in 0..500 {
        assert!(client.get_variant("e1", &user(i)).is_some());
    }
    assert_eq!(client.tracker().events_named(ASSIGNMENT_EVENT).len(), 500);
}

#[test]
fn device_targeting_excludes_other_devices() {
    init();
    let client = client_with(
        experiment("mobile-only", 100.0)
            .with_targeting(Targeting::default().with_devices([Device::Mobile])),
    );

    for i in 0..100 {
        assert_eq!(
            client.get_variant("mobile-only", &user(i).with_device(Device::Desktop)),
            None
        );
        assert!(client
            .get_variant("mobile-only", &user(i).with_device(Device::Mobile))
            .is_some());
    }
}

#[test]
fn invalid_experiments_are_rejected() {
    let client = ClientConfig::in_memory().to_client();

    let short = ExperimentConfig::new(
        "e1",
        "Short",
        vec![
            ExperimentVariant::control("control", 45.0),
            ExperimentVariant::new("treatment", 45.0),
        ],
    );
    assert!(matches!(
        client.registry().create_experiment(short),
        Err(Error::InvalidExperiment(ValidationError::AllocationSum(_)))
    ));

    let no_control = ExperimentConfig::new(
        "e1",
        "No control",
        vec![
            ExperimentVariant::new("a", 50.0),
            ExperimentVariant::new("b", 50.0),
        ],
    );
    assert!(matches!(
        client.registry().create_experiment(no_control),
        Err(Error::InvalidExperiment(ValidationError::NoControlVariant))
    ));

    assert!(client.registry().get_experiment("e1").is_none());
    assert!(client
        .registry()
        .create_experiment(experiment("e1", 100.0))
        .is_ok());
}

#[test]
fn repeated_requests_assign_once() {
    init();
    let client = client_with(experiment("e1", 100.0));
    let context = UserContext::new("u1", "s1");

    for _ in 0..5 {
        client.get_variant("e1", &context);
    }

    assert_eq!(client.registry().assignments_for_user("u1").len(), 1);
    assert_eq!(client.tracker().events_named(ASSIGNMENT_EVENT).len(), 1);
}

#[test]
fn file_storage_keeps_assignments_across_clients() {
    init();
    let dir = std::env::temp_dir().join(format!(
        "splitkit-assignments-{}",
        splitkit::generate_session_id()
    ));

    let variant = {
        let storage = FileStorage::open(&dir).unwrap();
        let client = ClientConfig::new(storage).to_client();
        client
            .registry()
            .create_experiment(experiment("e1", 100.0))
            .unwrap();
        client.get_variant("e1", &UserContext::new("u1", "s1"))
    };

    let registry = Arc::new(Registry::load(Arc::new(FileStorage::open(&dir).unwrap())));
    assert_eq!(
        registry
            .get_assignment("e1", "u1")
            .map(|a| a.variant_id),
        variant
    );

    let _ = std::fs::remove_dir_all(&dir);
}
