//! Example: Receiving video.
//!
//! Connects to the first source found (or the first whose name or address
//! contains the argument) and prints frame details for 30 seconds.
//!
//! Run with: `cargo run --example recv_video -- CAMERA1`

use std::time::{Duration, Instant};

use grafton_av::{Error, Finder, FinderOptions, Receiver, ReceiverOptions, Runtime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = Runtime::new()?;
    let finder = Finder::new(&runtime, &FinderOptions::default())?;

    let host = std::env::args().nth(1).unwrap_or_default();
    println!("Looking for sources...");
    let Some(source) = finder.find_by_host(&host, Duration::from_secs(10)).await else {
        println!("No source found.");
        return Ok(());
    };
    println!("Receiving from {source}");

    let receiver = Receiver::new(
        &runtime,
        &ReceiverOptions::builder(source)
            .name("recv_video demo")
            .build()?,
    )?;

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(30) {
        match receiver.video(Duration::from_secs(1)).await {
            Ok(frame) => println!(
                "{}x{} {:?} ts={} tc={}",
                frame.width, frame.height, frame.fourcc, frame.timestamp, frame.timecode
            ),
            Err(e) if e.is_timeout() => println!("No video this second."),
            Err(e) => return Err(e),
        }
    }

    let status = receiver.status();
    println!(
        "Received {} video frames, {} replaced before they were read",
        status.video_frames, status.dropped_video
    );
    receiver.destroy();
    Ok(())
}
