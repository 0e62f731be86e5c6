//! Example: Listing sources on the network.
//!
//! Prints the source list every time it changes, for 15 seconds.
//! Extra discovery peers can be given as arguments.
//!
//! Run with: `cargo run --example find -- 192.168.0.110`

use std::time::{Duration, Instant};

use grafton_av::{Error, Finder, FinderOptions, Runtime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = Runtime::new()?;

    let peers: Vec<String> = std::env::args().skip(1).collect();
    let mut options = FinderOptions::builder();
    if !peers.is_empty() {
        options = options.extra_ips(peers);
    }
    let finder = Finder::new(&runtime, &options.build())?;

    // Run for 15 seconds
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(15) {
        println!("Waiting for sources...");
        if !finder.wait_for_sources(Duration::from_secs(5)).await {
            println!("No change to the sources found.");
            continue;
        }

        let sources = finder.current_sources();
        println!("Network sources ({} found).", sources.len());
        for (i, source) in sources.iter().enumerate() {
            println!("{}. {}", i + 1, source);
        }
    }

    Ok(())
}
