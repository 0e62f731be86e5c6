//! The flat API keeps process-wide state, so everything runs in one test.

use std::time::Duration;

use grafton_av::{global, Error, FinderOptions, ReceiverOptions, RoutingOptions, SenderOptions};

#[tokio::test]
async fn test_flat_lifecycle() {
    if !global::is_supported_cpu() {
        assert!(!global::initialize());
        assert_eq!(global::version(), None);
        assert!(global::find(&FinderOptions::default()).await.unwrap().is_empty());
        return;
    }

    let options = SenderOptions::builder("Flat Camera")
        .clock_video(false)
        .build()
        .unwrap();

    // Nothing works before initialize
    assert!(matches!(global::send(&options), Err(Error::NotInitialized)));
    assert!(matches!(
        global::find(&FinderOptions::default()).await,
        Err(Error::NotInitialized)
    ));
    assert!(!global::destroy());

    assert!(global::initialize());
    assert!(global::initialize());
    assert!(global::version().is_some_and(|v| v.starts_with("grafton-av ")));

    let sender = global::send(&options).unwrap();
    let sources = global::find(&FinderOptions::default()).await.unwrap();
    assert!(sources.iter().any(|s| s.name == sender.source().name));

    let receiver = global::receive(&ReceiverOptions::builder(sender.source()).build().unwrap()).unwrap();
    assert!(sender.wait_for_connections(Duration::from_secs(5)).await);

    let proxy = global::routing(&RoutingOptions::builder("Flat Program").build().unwrap()).unwrap();
    assert_eq!(proxy.change(&sender.source()).unwrap(), 1);

    assert!(global::destroy());
    assert!(!global::destroy());

    // Existing sessions keep working, new ones are refused
    assert!(matches!(
        global::routing(&RoutingOptions::builder("Flat Late").build().unwrap()),
        Err(Error::NotInitialized)
    ));
    assert!(sender.connections() >= 1);
    sender
        .send_metadata(&grafton_av::MetadataFrame::with_data("<still_here/>", 0))
        .unwrap();
    assert_eq!(
        receiver.metadata(Duration::from_secs(5)).await.unwrap().data,
        "<still_here/>"
    );

    proxy.destroy().await;
    receiver.destroy();
    sender.destroy().await;
}
