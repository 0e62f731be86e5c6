use std::time::Duration;

use grafton_av::{
    Config, Finder, FinderOptions, Receiver, ReceiverOptions, Runtime, Sender, SenderOptions,
};

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::with_config(Config::default().multicast(false).discovery_port(0)).unwrap()
}

fn sender(runtime: &Runtime, name: &str, groups: Option<&str>) -> Sender {
    let mut options = SenderOptions::builder(name).clock_video(false);
    if let Some(groups) = groups {
        options = options.groups(groups);
    }
    Sender::new(runtime, &options.build().unwrap()).unwrap()
}

fn names(finder: &Finder) -> Vec<String> {
    finder
        .current_sources()
        .into_iter()
        .map(|source| source.name)
        .collect()
}

#[test]
fn test_runtime_handles_share_one_engine() {
    let runtime = runtime();
    assert!(Runtime::is_running());

    let clone = runtime.clone();
    drop(runtime);
    assert!(Runtime::is_running());
    assert!(!clone.config().multicast_enabled);
}

#[test]
fn test_version_and_platform() {
    assert!(Runtime::version().starts_with("grafton-av "));
    if Runtime::is_supported_cpu() {
        assert!(runtime().config().validate().is_ok());
    }
}

#[tokio::test]
async fn test_local_sender_is_listed_and_withdrawn() {
    let runtime = runtime();
    let finder = Finder::new(&runtime, &FinderOptions::default()).unwrap();
    let camera = sender(&runtime, "Lifecycle Camera", None);
    let name = camera.source().name;
    assert!(name.ends_with(" (Lifecycle Camera)"));

    let found = finder.sources(WAIT).await;
    assert!(found.iter().any(|source| source.name == name));
    assert!(finder.find_by_host("Lifecycle Camera", WAIT).await.is_some());

    camera.destroy().await;
    assert!(!names(&finder).contains(&name));
}

#[tokio::test]
async fn test_hidden_local_sources() {
    let runtime = runtime();
    let camera = sender(&runtime, "Lifecycle Hidden", None);
    let finder = Finder::new(
        &runtime,
        &FinderOptions::builder().show_local_sources(false).build(),
    )
    .unwrap();

    assert!(!names(&finder).contains(&camera.source().name));
    camera.destroy().await;
}

#[tokio::test]
async fn test_group_filters() {
    let runtime = runtime();
    let studio = sender(&runtime, "Lifecycle Studio", Some("Studio"));
    let public = Finder::new(&runtime, &FinderOptions::default()).unwrap();
    let grouped = Finder::new(
        &runtime,
        &FinderOptions::builder().groups(["studio", "news"]).build(),
    )
    .unwrap();

    let name = studio.source().name;
    assert!(!names(&public).contains(&name));
    assert!(names(&grouped).contains(&name));

    studio.destroy().await;
}

#[tokio::test]
async fn test_duplicate_sender_names_rejected() {
    let runtime = runtime();
    let first = sender(&runtime, "Lifecycle Duplicate", None);
    let options = SenderOptions::builder("Lifecycle Duplicate").build().unwrap();
    assert!(matches!(
        Sender::new(&runtime, &options),
        Err(grafton_av::Error::InvalidConfiguration(_))
    ));

    first.destroy().await;
    // The name is free again once withdrawn
    let second = Sender::new(&runtime, &options).unwrap();
    second.destroy().await;
}

#[tokio::test]
async fn test_named_receivers_are_discoverable() {
    let runtime = runtime();
    let camera = sender(&runtime, "Lifecycle Receiver Target", None);
    let finder = Finder::new(&runtime, &FinderOptions::default()).unwrap();

    let receiver = Receiver::new(
        &runtime,
        &ReceiverOptions::builder(camera.source())
            .name("Lifecycle Monitor")
            .build()
            .unwrap(),
    )
    .unwrap();
    let listed = |finder: &Finder| {
        finder
            .current_receivers()
            .iter()
            .any(|r| r.name.ends_with(" (Lifecycle Monitor)"))
    };
    assert!(listed(&finder));

    receiver.destroy();
    assert!(!listed(&finder));
    camera.destroy().await;
}

#[tokio::test]
async fn test_wait_for_sources_reports_changes() {
    let runtime = runtime();
    let finder = Finder::new(&runtime, &FinderOptions::default()).unwrap();
    // Consume whatever happened before
    finder.wait_for_sources(Duration::ZERO).await;

    let camera = sender(&runtime, "Lifecycle Change", None);
    assert!(finder.wait_for_sources(WAIT).await);
    camera.destroy().await;
    assert!(finder.wait_for_sources(WAIT).await);
}

#[tokio::test]
async fn test_receiver_by_name_resolves_through_registry() {
    let runtime = runtime();
    let camera = sender(&runtime, "Lifecycle By Name", None);
    let by_name = grafton_av::Source::named(camera.source().name);

    let receiver = Receiver::new(&runtime, &ReceiverOptions::builder(by_name).build().unwrap()).unwrap();
    assert!(camera.wait_for_connections(WAIT).await);

    receiver.destroy();
    camera.destroy().await;
}

#[test]
fn test_finder_waits_outside_tokio() {
    let runtime = runtime();
    let finder = Finder::new(&runtime, &FinderOptions::default()).unwrap();
    futures::executor::block_on(async {
        finder.wait_for_sources(Duration::ZERO).await;
        // Other tests share the registry, so only the timed wait itself is checked
        finder.wait_for_sources(Duration::from_millis(20)).await;
        let camera = sender(&runtime, "Lifecycle Foreign Executor", None);
        let found = finder.find_by_host("Lifecycle Foreign Executor", WAIT).await;
        assert_eq!(found.map(|s| s.name), Some(camera.source().name));
        camera.destroy().await;
    });
}
