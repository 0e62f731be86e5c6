//! Receiving video, audio and metadata from a source.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use crate::{
    clock::ClockOffset,
    discovery::{Announcement, EntryKind},
    finder::{Source, SourceAddress},
    frames::{AudioFormat, AudioFrame, FrameType, MetadataFrame, Tally, VideoFrame},
    transport::{
        codec::{Hello, Message, RawMessage, PROTOCOL_VERSION},
        queue::FrameQueue,
        InboundLink, LinkSink,
    },
    Error, Result, Runtime,
};

/// Color format a receiver asks for.
///
/// Frames are delivered in the format the sender produced; the value is
/// passed to the sender as a preference. [`ColorFormat::BGRX_BGRA_FLIPPED`]
/// additionally delivers packed frames bottom-to-top with a negative stride.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum ColorFormat {
    #[default]
    BGRX_BGRA = 0,
    UYVY_BGRA = 1,
    RGBX_RGBA = 2,
    UYVY_RGBA = 3,
    Fastest = 100,
    Best = 101,
    BGRX_BGRA_FLIPPED = 200,
}

/// How much of a source a receiver pulls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Bandwidth {
    /// Metadata only.
    MetadataOnly = -10,
    /// Metadata and audio.
    AudioOnly = 10,
    /// Everything, at half the video frame rate.
    Lowest = 0,
    /// Everything.
    #[default]
    Highest = 100,
}

/// Receiver configuration, fixed when the receiver is created.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub source: Source,
    pub color_format: ColorFormat,
    pub bandwidth: Bandwidth,
    /// Deliver Field0/Field1 frames as they arrive instead of weaving them.
    pub allow_video_fields: bool,
    /// Advertise the receiver under this name.
    pub name: Option<String>,
}

impl ReceiverOptions {
    /// Create a builder for configuring a receiver
    pub fn builder(source: Source) -> ReceiverOptionsBuilder {
        ReceiverOptionsBuilder::new(source)
    }
}

/// Builder for configuring a Receiver with ergonomic method chaining
#[derive(Debug, Clone)]
pub struct ReceiverOptionsBuilder {
    source: Source,
    color_format: Option<ColorFormat>,
    bandwidth: Option<Bandwidth>,
    allow_video_fields: Option<bool>,
    name: Option<String>,
}

impl ReceiverOptionsBuilder {
    /// Create a new builder with the specified source
    pub fn new(source: Source) -> Self {
        ReceiverOptionsBuilder {
            source,
            color_format: None,
            bandwidth: None,
            allow_video_fields: None,
            name: None,
        }
    }

    /// Set the color format for received video
    #[must_use]
    pub fn color(mut self, fmt: ColorFormat) -> Self {
        self.color_format = Some(fmt);
        self
    }

    /// Set the bandwidth mode for the receiver
    #[must_use]
    pub fn bandwidth(mut self, bw: Bandwidth) -> Self {
        self.bandwidth = Some(bw);
        self
    }

    /// Configure whether to allow video fields
    #[must_use]
    pub fn allow_video_fields(mut self, allow: bool) -> Self {
        self.allow_video_fields = Some(allow);
        self
    }

    /// Set the name for this receiver
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the options.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if the source has no name, or the
    /// receiver name is present but blank.
    pub fn build(self) -> Result<ReceiverOptions> {
        if self.source.name.trim().is_empty() && self.source.address == SourceAddress::None {
            return Err(Error::InvalidConfiguration(
                "Source needs a name or an address".into(),
            ));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::InvalidConfiguration(
                "Receiver name must not be blank".into(),
            ));
        }
        Ok(ReceiverOptions {
            source: self.source,
            color_format: self.color_format.unwrap_or_default(),
            bandwidth: self.bandwidth.unwrap_or_default(),
            allow_video_fields: self.allow_video_fields.unwrap_or(true),
            name: self.name,
        })
    }
}

/// Output format for one audio pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCaptureOptions {
    pub format: AudioFormat,
    /// Headroom in dB used when `format` is 16-bit.
    pub reference_level: i32,
}

impl Default for AudioCaptureOptions {
    fn default() -> Self {
        Self {
            format: AudioFormat::Float32Separate,
            reference_level: 0,
        }
    }
}

impl AudioCaptureOptions {
    pub fn new(format: AudioFormat, reference_level: i32) -> Self {
        Self {
            format,
            reference_level,
        }
    }
}

/// Snapshot of a receiver's connection and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStatus {
    pub connected: bool,
    /// Name the source reported in the handshake.
    pub source_name: Option<String>,
    /// Latest estimate of the source clock relative to ours.
    pub clock_offset: Option<ClockOffset>,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub metadata_frames: u64,
    pub dropped_video: u64,
    pub dropped_audio: u64,
    pub dropped_metadata: u64,
}

/// Worker-side half of a receiver: decodes frames and queues them.
struct ReceiverSink {
    flip: bool,
    weave_fields: bool,
    video: FrameQueue<VideoFrame>,
    audio: FrameQueue<AudioFrame>,
    metadata: FrameQueue<MetadataFrame>,
    pending_field: Mutex<Option<VideoFrame>>,
    failed: AtomicBool,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    metadata_frames: AtomicU64,
}

impl ReceiverSink {
    fn on_video(&self, frame: VideoFrame) {
        let frame = if self.weave_fields && !frame.fourcc.is_planar_420() {
            match frame.frame_type {
                FrameType::Field0 => {
                    *self.pending_field.lock() = Some(frame);
                    return;
                }
                FrameType::Field1 => {
                    let Some(field0) = self.pending_field.lock().take() else {
                        tracing::trace!("unmatched Field1 dropped");
                        return;
                    };
                    match VideoFrame::weave(&field0, &frame) {
                        Ok(woven) => woven,
                        Err(e) => {
                            tracing::trace!(error = %e, "field pair dropped");
                            return;
                        }
                    }
                }
                _ => frame,
            }
        } else {
            frame
        };

        let frame = if self.flip && !frame.is_bottom_up() && !frame.fourcc.is_planar_420() {
            match frame.flipped() {
                Ok(flipped) => flipped,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        } else {
            frame
        };

        self.video_frames.fetch_add(1, Ordering::Relaxed);
        if !self.video.push(frame) {
            tracing::trace!("unread video frame replaced");
        }
    }

    fn fail(&self, error: Error) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.video.fail(error.duplicate());
        self.audio.fail(error.duplicate());
        self.metadata.fail(error);
    }

    fn close(&self) {
        self.video.close();
        self.audio.close();
        self.metadata.close();
    }
}

impl LinkSink for ReceiverSink {
    fn connected(&self, _source_name: &str) {}

    fn message(&self, raw: RawMessage) {
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        match Message::decode(&raw) {
            Ok(Message::Video(frame)) => self.on_video(frame),
            Ok(Message::Audio(frame)) => {
                self.audio_frames.fetch_add(1, Ordering::Relaxed);
                if !self.audio.push(frame) {
                    tracing::trace!("oldest audio frame dropped");
                }
            }
            Ok(Message::Metadata(frame)) => {
                self.metadata_frames.fetch_add(1, Ordering::Relaxed);
                self.metadata.push(frame);
            }
            Ok(_) => {}
            Err(e) => self.fail(e),
        }
    }

    fn disconnected(&self, error: Error) {
        self.fail(error);
    }
}

/// A connection to one source.
///
/// Frames are read on the worker threads and queued: the latest video
/// frame, and bounded FIFOs of audio and metadata. Pulls take from those
/// queues and never see a frame twice.
///
/// # Examples
///
/// ```no_run
/// # use grafton_av::{Runtime, Receiver, ReceiverOptions, Source};
/// # use std::time::Duration;
/// # async fn run() -> Result<(), grafton_av::Error> {
/// let runtime = Runtime::new()?;
/// let options = ReceiverOptions::builder(Source::named("STUDIO (Camera 1)")).build()?;
/// let receiver = Receiver::new(&runtime, &options)?;
///
/// let frame = receiver.video(Duration::from_secs(5)).await?;
/// println!("{}x{} at {}", frame.width, frame.height, frame.timestamp);
/// # Ok(())
/// # }
/// ```
pub struct Receiver {
    runtime: Runtime,
    source: Source,
    link: InboundLink,
    sink: Arc<ReceiverSink>,
    announcement: Mutex<Option<Announcement>>,
    closed: AtomicBool,
}

impl Receiver {
    /// Creates a receiver and starts connecting in the background.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if the source cannot be resolved to an
    /// address or the receiver name is already advertised. Connection
    /// failures are reported by the next pull.
    pub fn new(runtime: &Runtime, options: &ReceiverOptions) -> Result<Self> {
        let addr = resolve_source(runtime, &options.source)?;
        let config = runtime.config();
        let discovery = runtime.discovery();

        let announcement = match &options.name {
            Some(name) => Some(discovery.advertise(
                EntryKind::Receiver,
                &discovery.advertised_name(name),
                None,
                config.discovery_port.max(1),
            )?),
            None => None,
        };
        let receiver_name = announcement
            .as_ref()
            .map_or_else(|| discovery.machine_name().to_owned(), |a| a.name().to_owned());

        let sink = Arc::new(ReceiverSink {
            flip: options.color_format == ColorFormat::BGRX_BGRA_FLIPPED,
            weave_fields: !options.allow_video_fields,
            video: FrameQueue::new(1, "video frame", "receiver"),
            audio: FrameQueue::new(config.audio_queue_depth, "audio frame", "receiver"),
            metadata: FrameQueue::new(config.metadata_queue_depth, "metadata", "receiver"),
            pending_field: Mutex::new(None),
            failed: AtomicBool::new(false),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            metadata_frames: AtomicU64::new(0),
        });

        let hello = Hello {
            version: PROTOCOL_VERSION,
            receiver_name,
            color_format: options.color_format.into(),
            bandwidth: options.bandwidth.into(),
            allow_video_fields: options.allow_video_fields,
        };
        let link = InboundLink::open(runtime.handle(), config, addr, hello, sink.clone());

        tracing::info!(
            source = %options.source,
            %addr,
            bandwidth = ?options.bandwidth,
            color_format = ?options.color_format,
            "receiver created"
        );

        Ok(Self {
            runtime: runtime.clone(),
            source: options.source.clone(),
            link,
            sink,
            announcement: Mutex::new(announcement),
            closed: AtomicBool::new(false),
        })
    }

    /// The source this receiver was created for.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Waits up to `timeout` for the next video frame.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no frame arrived in time, [`Error::Transport`]
    /// once the connection has failed and every queued frame was read,
    /// [`Error::Closed`] after [`destroy`](Self::destroy).
    pub async fn video(&self, timeout: Duration) -> Result<VideoFrame> {
        self.sink.video.pop(self.runtime.handle(), timeout).await
    }

    /// Waits up to `timeout` for the next audio frame, repacked as
    /// `options` asks.
    pub async fn audio(&self, options: &AudioCaptureOptions, timeout: Duration) -> Result<AudioFrame> {
        let frame = self.sink.audio.pop(self.runtime.handle(), timeout).await?;
        frame.convert(options.format, options.reference_level)
    }

    /// Waits up to `timeout` for the next metadata frame from the source.
    pub async fn metadata(&self, timeout: Duration) -> Result<MetadataFrame> {
        self.sink.metadata.pop(self.runtime.handle(), timeout).await
    }

    /// Sends metadata to the source.
    pub fn send_metadata(&self, frame: &MetadataFrame) -> Result<()> {
        self.ensure_open()?;
        self.link.send_metadata(frame.clone());
        Ok(())
    }

    /// Tells the source whether it is on program or preview.
    pub fn set_tally(&self, tally: Tally) -> Result<()> {
        self.send_metadata(&tally.to_metadata())
    }

    pub fn status(&self) -> ReceiverStatus {
        ReceiverStatus {
            connected: self.link.is_connected(),
            source_name: self.link.source_name(),
            clock_offset: self.link.clock_offset(),
            video_frames: self.sink.video_frames.load(Ordering::Relaxed),
            audio_frames: self.sink.audio_frames.load(Ordering::Relaxed),
            metadata_frames: self.sink.metadata_frames.load(Ordering::Relaxed),
            dropped_video: self.sink.video.dropped(),
            dropped_audio: self.sink.audio.dropped(),
            dropped_metadata: self.sink.metadata.dropped(),
        }
    }

    /// Disconnects and releases the connection. Calling it again does
    /// nothing. Pulls afterwards fail with [`Error::Closed`].
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.close();
        self.sink.close();
        self.announcement.lock().take();
        tracing::info!(source = %self.source, "receiver destroyed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed("receiver"))
        } else {
            Ok(())
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Resolves a source to a connect address.
///
/// Numeric addresses are used as they are, host names are looked up, and a
/// source without an address is found by name in the registry.
pub(crate) fn resolve_source(runtime: &Runtime, source: &Source) -> Result<SocketAddr> {
    if let Some(addr) = source.address.socket_addr() {
        return Ok(addr);
    }
    match (&source.address, source.address.host(), source.address.port()) {
        (SourceAddress::None, _, _) => runtime.discovery().lookup(&source.name).ok_or_else(|| {
            Error::InvalidConfiguration(format!("Source '{}' has not been discovered", source.name))
        }),
        (_, Some(host), Some(port)) => (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidConfiguration(format!("Cannot resolve '{host}': {e}")))?
            .next()
            .ok_or_else(|| Error::InvalidConfiguration(format!("'{host}' has no addresses"))),
        _ => Err(Error::InvalidConfiguration(format!(
            "Source address of '{source}' has no port"
        ))),
    }
}
