use std::time::{Duration, Instant};

use grafton_av::{
    Config, Receiver, ReceiverOptions, RoutingOptions, RoutingProxy, Runtime, Sender,
    SenderOptions, Source, Tally, VideoFrame,
};

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::with_config(Config::default().multicast(false).discovery_port(0)).unwrap()
}

fn sender(runtime: &Runtime, name: &str) -> Sender {
    let options = SenderOptions::builder(name)
        .clock_video(false)
        .clock_audio(false)
        .build()
        .unwrap();
    Sender::new(runtime, &options).unwrap()
}

fn proxy(runtime: &Runtime, name: &str) -> RoutingProxy {
    RoutingProxy::new(runtime, &RoutingOptions::builder(name).build().unwrap()).unwrap()
}

/// Keeps pushing frames tagged with `timecode` from `sender` until the
/// receiver sees one.
async fn expect_frames_from(sender: &Sender, receiver: &Receiver, timecode: i64) {
    let frame = VideoFrame::builder()
        .resolution(16, 16)
        .timecode(timecode)
        .build();
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(
            Instant::now() < deadline,
            "no frame with timecode {timecode} arrived"
        );
        sender.video(&frame).await.unwrap();
        if let Ok(received) = receiver.video(Duration::from_millis(50)).await {
            if received.timecode == timecode {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_change_switches_upstream_without_reconnecting() {
    let runtime = runtime();
    let camera_a = sender(&runtime, "Routing Camera A");
    let camera_b = sender(&runtime, "Routing Camera B");
    let program = proxy(&runtime, "Routing Program");

    let receiver = Receiver::new(
        &runtime,
        &ReceiverOptions::builder(program.source()).build().unwrap(),
    )
    .unwrap();
    assert!(program.wait_for_connections(WAIT).await);
    assert!(program.connections() >= 1);

    let first = program.change(&camera_a.source()).unwrap();
    assert_eq!(program.generation(), first);
    assert_eq!(program.sourcename(), camera_a.source().name);
    expect_frames_from(&camera_a, &receiver, 1).await;

    let second = program.change(&camera_b.source()).unwrap();
    assert!(second > first);
    assert_eq!(program.upstream(), Some(camera_b.source()));
    expect_frames_from(&camera_b, &receiver, 2).await;

    // The receiver stayed on its original connection
    assert!(receiver.status().connected);
    assert_eq!(
        receiver.status().source_name.as_deref(),
        Some(program.source().name.as_str())
    );

    program.destroy().await;
    camera_a.destroy().await;
    camera_b.destroy().await;
}

#[tokio::test]
async fn test_clear_detaches_upstream() {
    let runtime = runtime();
    let camera = sender(&runtime, "Routing Clear Camera");
    let program = proxy(&runtime, "Routing Clear");

    assert!(!program.clear());
    assert_eq!(program.sourcename(), "");
    assert_eq!(program.generation(), 0);

    let generation = program.change(&camera.source()).unwrap();
    assert!(program.clear());
    assert!(!program.clear());
    assert_eq!(program.sourcename(), "");
    assert_eq!(program.upstream(), None);
    assert_eq!(program.generation(), generation);

    let deadline = Instant::now() + WAIT;
    while camera.connections() > 0 {
        assert!(Instant::now() < deadline, "upstream link was not closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    program.destroy().await;
    camera.destroy().await;
}

#[tokio::test]
async fn test_proxy_cannot_route_to_itself() {
    let runtime = runtime();
    let program = proxy(&runtime, "Routing Loop");

    let error = program.change(&program.source()).unwrap_err();
    assert!(matches!(error, grafton_av::Error::InvalidConfiguration(_)));

    // Same endpoint under another name
    let alias = Source {
        name: "ELSEWHERE (alias)".into(),
        address: program.source().address,
    };
    assert!(program.change(&alias).is_err());
    assert_eq!(program.generation(), 0);

    program.destroy().await;
}

#[tokio::test]
async fn test_downstream_tally_reaches_upstream() {
    let runtime = runtime();
    let camera = sender(&runtime, "Routing Tally Camera");
    let program = proxy(&runtime, "Routing Tally");
    program.change(&camera.source()).unwrap();

    let receiver = Receiver::new(
        &runtime,
        &ReceiverOptions::builder(program.source()).build().unwrap(),
    )
    .unwrap();
    assert!(program.wait_for_connections(WAIT).await);
    receiver.set_tally(Tally::new(false, true)).unwrap();

    let deadline = Instant::now() + WAIT;
    while camera.tally() != Tally::new(false, true) {
        assert!(Instant::now() < deadline, "tally was not forwarded");
        camera.next_tally(Duration::from_millis(100)).await;
    }

    program.destroy().await;
    camera.destroy().await;
}

#[tokio::test]
async fn test_change_after_destroy_fails() {
    let runtime = runtime();
    let camera = sender(&runtime, "Routing Destroyed Camera");
    let program = proxy(&runtime, "Routing Destroyed");

    program.destroy().await;
    program.destroy().await;
    assert!(program.change(&camera.source()).unwrap_err().is_closed());

    camera.destroy().await;
}
