//! Example: Sending video.
//!
//! Sends a 1280x720 BGRX stream at 29.97 fps with a moving bar until
//! Ctrl-C. The sender paces itself to the frame rate.
//!
//! Run with: `cargo run --example send_video`

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use grafton_av::{Error, FourCC, Runtime, Sender, SenderOptions, VideoFrame, TIMECODE_SYNTHESIZE};
use tracing_subscriber::EnvFilter;

const WIDTH: i32 = 1280;
const HEIGHT: i32 = 720;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Set up signal handler for graceful shutdown
    let exit_loop = Arc::new(AtomicBool::new(false));
    let exit_loop_clone = exit_loop.clone();
    ctrlc::set_handler(move || {
        exit_loop_clone.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let runtime = Runtime::new()?;
    let sender = Sender::new(&runtime, &SenderOptions::builder("My Video").build()?)?;
    println!("Sending as {}", sender.source());

    let mut frame_no = 0usize;
    while !exit_loop.load(Ordering::Relaxed) {
        let batch_start = Instant::now();

        for _ in 0..100 {
            if exit_loop.load(Ordering::Relaxed) {
                break;
            }
            let frame = VideoFrame::builder()
                .resolution(WIDTH, HEIGHT)
                .fourcc(FourCC::BGRX)
                .frame_rate(30000, 1001)
                .timecode(TIMECODE_SYNTHESIZE)
                .data(moving_bar(frame_no))
                .build();
            sender.video(&frame).await?;
            frame_no += 1;
        }

        let elapsed = batch_start.elapsed().as_secs_f32();
        println!(
            "100 frames sent at {:.2}fps to {} receiver(s)",
            100.0 / elapsed,
            sender.connections()
        );
    }

    sender.destroy().await;
    Ok(())
}

/// A white vertical bar on black that moves 8 pixels per frame.
fn moving_bar(frame_no: usize) -> Vec<u8> {
    let stride = WIDTH as usize * 4;
    let bar = (frame_no * 8) % WIDTH as usize;
    let mut row = vec![0u8; stride];
    for x in bar..(bar + 32).min(WIDTH as usize) {
        row[x * 4..x * 4 + 4].copy_from_slice(&[255, 255, 255, 255]);
    }
    row.repeat(HEIGHT as usize)
}
