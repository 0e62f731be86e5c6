//! Real-time video, audio and metadata over IP.
//!
//! `grafton-av` discovers sources on the local network, receives frames from
//! them, publishes frames as a named source, and re-routes sources through
//! virtual proxies. Everything runs on a process-wide engine with its own
//! worker threads; the calling task is never blocked by network work.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use grafton_av::{Finder, FinderOptions, Runtime};
//!
//! # async fn run() -> Result<(), grafton_av::Error> {
//! // Start (or join) the engine
//! let runtime = Runtime::new()?;
//!
//! // Find sources on the network
//! let options = FinderOptions::builder().show_local_sources(true).build();
//! let finder = Finder::new(&runtime, &options)?;
//!
//! for source in finder.sources(Duration::from_secs(5)).await {
//!     println!("Found: {}", source);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! ## Runtime Management
//!
//! [`Runtime`] is a reference-counted handle to the engine. The first handle
//! starts it and the last one stops it. Every session holds a handle of its
//! own. The [`global`] module offers the same lifecycle as a flat
//! `initialize`/`destroy` pair.
//!
//! ## Source Discovery
//!
//! [`Finder`] lists the sources announced on the network, filtered by
//! groups. Hosts that multicast does not reach can be queried directly with
//! extra IPs.
//!
//! ## Receiving
//!
//! [`Receiver`] connects to one source and queues what it reads: the latest
//! video frame and bounded queues of audio and metadata. Pulls wait with a
//! timeout.
//!
//! ## Sending
//!
//! [`Sender`] advertises a named source and fans frames out to every
//! connected receiver, optionally pacing itself to the frame rate.
//!
//! ## Routing
//!
//! [`RoutingProxy`] is an advertised source whose content comes from another
//! source, switchable at runtime without disconnecting its receivers.
//!
//! # Time
//!
//! Frames carry a [`PtpTimestamp`] (network time, nanoseconds) and a
//! timecode. A zero timestamp or a [`TIMECODE_SYNTHESIZE`] timecode is
//! filled in by the sender.
//!
//! # Platform Support
//!
//! - **Linux** and **macOS**: any architecture
//! - **Windows**: x86 and x86-64
//!
//! x86 CPUs need SSE4.2; see [`Runtime::is_supported_cpu`].

#![allow(non_camel_case_types)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod discovery;
mod error;
mod transport;

// Public modules
pub mod clock;
pub mod config;
pub mod finder;
pub mod frames;
pub mod global;
pub mod receiver;
pub mod routing;
pub mod runtime;
pub mod sender;

// Re-exports
pub use {
    clock::{ClockOffset, FramePacer, PtpTimestamp, TIMECODE_SYNTHESIZE},
    config::{Config, StringList, DEFAULT_DISCOVERY_PORT, DEFAULT_MULTICAST_GROUP},
    error::*,
    finder::{Finder, FinderOptions, FinderOptionsBuilder, Source, SourceAddress},
    frames::{
        calculate_line_stride, fourcc, AudioFormat, AudioFrame, AudioFrameBuilder, FourCC,
        FrameType, MetadataFrame, Tally, VideoFrame, VideoFrameBuilder,
    },
    receiver::{
        AudioCaptureOptions, Bandwidth, ColorFormat, Receiver, ReceiverOptions,
        ReceiverOptionsBuilder, ReceiverStatus,
    },
    routing::{RoutingOptions, RoutingOptionsBuilder, RoutingProxy},
    runtime::Runtime,
    sender::{Pacing, Sender, SenderOptions, SenderOptionsBuilder},
};

#[cfg(feature = "image-encoding")]
pub use frames::ImageFormat;

/// Alias for Result with our Error type
pub type Result<T> = std::result::Result<T, crate::error::Error>;

// Tests
#[cfg(test)]
#[path = "tests.rs"]
mod tests;
