//! Sending video, audio and metadata as a discoverable source.

use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    clock::{FramePacer, PtpTimestamp, TIMECODE_SYNTHESIZE},
    config::StringList,
    discovery::{Announcement, EntryKind},
    finder::{Source, SourceAddress},
    frames::{AudioFrame, MetadataFrame, Tally, VideoFrame},
    runtime::{self, EngineSleep},
    transport::{codec::Message, OutboundHub},
    Error, Result, Runtime,
};

/// How long [`Sender::destroy`] waits for receivers to hang up.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Which stream paces outgoing frames.
///
/// With video pacing each [`Sender::video`] call returns no sooner than one
/// frame duration after the previous one; audio pacing does the same for
/// [`Sender::audio`]. The other stream is sent as fast as it is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Video,
    Audio,
    None,
}

#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub name: String,
    pub groups: Option<String>,
    pub clock_video: bool,
    pub clock_audio: bool,
}

impl SenderOptions {
    /// Create a builder for configuring send options
    pub fn builder<S: Into<String>>(name: S) -> SenderOptionsBuilder {
        SenderOptionsBuilder::new(name)
    }

    /// Video pacing wins when both clocks are enabled.
    pub fn pacing(&self) -> Pacing {
        if self.clock_video {
            Pacing::Video
        } else if self.clock_audio {
            Pacing::Audio
        } else {
            Pacing::None
        }
    }
}

/// Builder for configuring SenderOptions with ergonomic method chaining
#[derive(Debug, Clone)]
pub struct SenderOptionsBuilder {
    name: String,
    groups: Option<StringList>,
    clock_video: Option<bool>,
    clock_audio: Option<bool>,
}

impl SenderOptionsBuilder {
    /// Create a new builder with the specified name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            groups: None,
            clock_video: None,
            clock_audio: None,
        }
    }

    /// Set the groups for this sender
    #[must_use]
    pub fn groups(mut self, groups: impl Into<StringList>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Configure whether to clock video
    #[must_use]
    pub fn clock_video(mut self, clock: bool) -> Self {
        self.clock_video = Some(clock);
        self
    }

    /// Configure whether to clock audio
    #[must_use]
    pub fn clock_audio(mut self, clock: bool) -> Self {
        self.clock_audio = Some(clock);
        self
    }

    /// Build the `SenderOptions`
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains only whitespace.
    pub fn build(self) -> Result<SenderOptions> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "Sender name cannot be empty or contain only whitespace".into(),
            ));
        }

        Ok(SenderOptions {
            name: self.name,
            groups: self.groups.as_ref().and_then(StringList::normalize),
            clock_video: self.clock_video.unwrap_or(true),
            clock_audio: self.clock_audio.unwrap_or(true),
        })
    }
}

/// An advertised source that receivers connect to.
///
/// Pushes return once the frame is queued for every connected receiver;
/// delivery is best effort. A slow receiver loses its oldest pending video
/// frame rather than holding up the others.
///
/// # Examples
///
/// ```no_run
/// # use grafton_av::{Runtime, Sender, SenderOptions, VideoFrame};
/// # async fn run() -> Result<(), grafton_av::Error> {
/// let runtime = Runtime::new()?;
/// let sender = Sender::new(&runtime, &SenderOptions::builder("Camera 1").build()?)?;
///
/// let frame = VideoFrame::builder().resolution(1280, 720).frame_rate(30, 1).build();
/// for _ in 0..30 {
///     sender.video(&frame).await?;
/// }
/// sender.destroy().await;
/// # Ok(())
/// # }
/// ```
pub struct Sender {
    runtime: Runtime,
    name: String,
    hub: OutboundHub,
    announcement: Mutex<Option<Announcement>>,
    pacing: Pacing,
    pacer: Mutex<FramePacer>,
    closed: AtomicBool,
}

impl Sender {
    /// Starts listening and advertises the source as
    /// `"<HOSTNAME> (<name>)"`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if this process already advertises
    /// the name, [`Error::Io`] if no listening socket could be opened.
    pub fn new(runtime: &Runtime, options: &SenderOptions) -> Result<Self> {
        let discovery = runtime.discovery();
        let name = discovery.advertised_name(&options.name);
        let hub = OutboundHub::bind(runtime.handle(), runtime.config(), &name)?;
        let announcement = discovery.advertise(
            EntryKind::Source,
            &name,
            options.groups.as_deref(),
            hub.port(),
        )?;

        Ok(Self {
            runtime: runtime.clone(),
            name,
            hub,
            announcement: Mutex::new(Some(announcement)),
            pacing: options.pacing(),
            pacer: Mutex::new(FramePacer::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// This sender as a source a receiver can connect to.
    pub fn source(&self) -> Source {
        Source {
            name: self.name.clone(),
            address: SourceAddress::Ip(format!("{}:{}", Ipv4Addr::LOCALHOST, self.hub.port())),
        }
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Queues a video frame for every connected receiver.
    ///
    /// A zero timestamp is replaced by the current time and a
    /// [`TIMECODE_SYNTHESIZE`] timecode by the current clock reading.
    /// With [`Pacing::Video`] the call waits for the frame's slot first.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidFrame`] if the frame is inconsistent,
    /// [`Error::Closed`] after [`destroy`](Self::destroy).
    pub async fn video(&self, frame: &VideoFrame) -> Result<()> {
        self.ensure_open()?;
        frame.validate()?;
        if self.pacing == Pacing::Video {
            let release = self.pacer.lock().schedule(frame.frame_duration());
            EngineSleep::until(self.runtime.handle(), release).await;
            self.ensure_open()?;
        }

        let mut frame = frame.clone();
        (frame.timestamp, frame.timecode) = stamp(frame.timestamp, frame.timecode);
        self.hub.broadcast(Message::Video(frame).encode());
        Ok(())
    }

    /// Queues an audio frame for every connected receiver. Sentinels and
    /// errors as for [`video`](Self::video).
    pub async fn audio(&self, frame: &AudioFrame) -> Result<()> {
        self.ensure_open()?;
        frame.validate()?;
        if self.pacing == Pacing::Audio {
            let release = self.pacer.lock().schedule(frame.duration());
            EngineSleep::until(self.runtime.handle(), release).await;
            self.ensure_open()?;
        }

        let mut frame = frame.clone();
        (frame.timestamp, frame.timecode) = stamp(frame.timestamp, frame.timecode);
        self.hub.broadcast(Message::Audio(frame).encode());
        Ok(())
    }

    /// Sends metadata to every connected receiver.
    pub fn send_metadata(&self, frame: &MetadataFrame) -> Result<()> {
        self.ensure_open()?;
        let mut frame = frame.clone();
        if frame.timecode == TIMECODE_SYNTHESIZE {
            frame.timecode = PtpTimestamp::now().as_nanos();
        }
        self.hub.broadcast(Message::Metadata(frame).encode());
        Ok(())
    }

    /// Next metadata frame sent by a receiver. Tally updates are not
    /// included; see [`tally`](Self::tally).
    pub async fn metadata(&self, timeout: Duration) -> Result<MetadataFrame> {
        self.hub.metadata(timeout).await
    }

    /// Number of connected receivers.
    pub fn connections(&self) -> usize {
        self.hub.connections()
    }

    /// Waits up to `timeout` for at least one receiver.
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        self.hub.wait_for_connections(timeout).await
    }

    /// Combined tally of every connected receiver.
    pub fn tally(&self) -> Tally {
        self.hub.tally()
    }

    /// Waits up to `timeout` for the combined tally to change.
    pub async fn next_tally(&self, timeout: Duration) -> Option<Tally> {
        let mut tally = self.hub.subscribe_tally();
        match runtime::timeout(self.runtime.handle(), timeout, tally.changed()).await {
            Some(Ok(())) => Some(*tally.borrow_and_update()),
            _ => None,
        }
    }

    /// Registers metadata every receiver gets right after connecting.
    /// Already connected receivers get it immediately.
    pub fn add_connection_metadata(&self, frame: &MetadataFrame) -> Result<()> {
        self.ensure_open()?;
        self.hub.add_connection_metadata(frame.clone());
        Ok(())
    }

    pub fn clear_connection_metadata(&self) {
        self.hub.clear_connection_metadata();
    }

    /// Frames replaced in per-connection queues before they were written.
    pub fn dropped(&self) -> u64 {
        self.hub.dropped()
    }

    /// Withdraws the source and disconnects every receiver. Calling it
    /// again does nothing; pushes afterwards fail with [`Error::Closed`].
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.announcement.lock().take();
        self.hub.shutdown(CLOSE_GRACE).await;
        tracing::info!(source = %self.name, "sender destroyed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.hub.is_closed() {
            Err(Error::Closed("sender"))
        } else {
            Ok(())
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.announcement.get_mut().take();
        self.hub.abort();
    }
}

/// Applies the send-time sentinels.
fn stamp(timestamp: PtpTimestamp, timecode: i64) -> (PtpTimestamp, i64) {
    let now = PtpTimestamp::now();
    let timestamp = if timestamp.is_zero() { now } else { timestamp };
    let timecode = if timecode == TIMECODE_SYNTHESIZE {
        now.as_nanos()
    } else {
        timecode
    };
    (timestamp, timecode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_policy() {
        let both = SenderOptions::builder("cam").build().unwrap();
        assert_eq!(both.pacing(), Pacing::Video);

        let audio = SenderOptions::builder("cam")
            .clock_video(false)
            .build()
            .unwrap();
        assert_eq!(audio.pacing(), Pacing::Audio);

        let none = SenderOptions::builder("cam")
            .clock_video(false)
            .clock_audio(false)
            .build()
            .unwrap();
        assert_eq!(none.pacing(), Pacing::None);
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(SenderOptions::builder("  ").build().is_err());
    }

    #[test]
    fn test_groups_accept_lists() {
        let options = SenderOptions::builder("cam")
            .groups(vec!["studio", "news"])
            .build()
            .unwrap();
        assert_eq!(options.groups.as_deref(), Some("studio,news"));
    }

    #[test]
    fn test_stamp_sentinels() {
        let (ts, tc) = stamp(PtpTimestamp::ZERO, TIMECODE_SYNTHESIZE);
        assert!(!ts.is_zero());
        assert_eq!(tc, ts.as_nanos());

        let given = PtpTimestamp::from_nanos(42);
        assert_eq!(stamp(given, 7), (given, 7));
    }
}
