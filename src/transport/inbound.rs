use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream},
    runtime::Handle,
    time::MissedTickBehavior,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use super::{
    codec::{FrameCodec, Hello, Message, MessageKind, RawMessage},
    queue::OutboundQueue,
};
use crate::{
    clock::{ClockOffset, PtpTimestamp},
    frames::MetadataFrame,
    Config, Error, Result,
};

/// Consumer of the messages an [`InboundLink`] reads.
///
/// Callbacks run on the worker runtime and must not block.
pub(crate) trait LinkSink: Send + Sync + 'static {
    fn connected(&self, source_name: &str);

    /// A video, audio or metadata message, still encoded.
    fn message(&self, raw: RawMessage);

    /// The link failed. Not called after [`InboundLink::close`].
    fn disconnected(&self, error: Error);
}

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    source_name: Mutex<Option<String>>,
    clock_offset: Mutex<Option<ClockOffset>>,
}

/// Outgoing connection to one source.
pub(crate) struct InboundLink {
    addr: SocketAddr,
    upstream: Arc<OutboundQueue>,
    state: Arc<LinkState>,
    cancel: CancellationToken,
}

impl InboundLink {
    /// Connects to `addr` on `handle` and performs the handshake in the
    /// background. Failures are reported to `sink`.
    pub(crate) fn open(
        handle: &Handle,
        config: &Config,
        addr: SocketAddr,
        hello: Hello,
        sink: Arc<dyn LinkSink>,
    ) -> Self {
        let upstream = Arc::new(OutboundQueue::new(1, config.metadata_queue_depth));
        upstream.push(Message::Hello(hello).encode());
        let state = Arc::new(LinkState::default());
        let cancel = CancellationToken::new();

        handle.spawn(run(
            config.clone(),
            addr,
            upstream.clone(),
            state.clone(),
            cancel.clone(),
            sink,
        ));

        Self {
            addr,
            upstream,
            state,
            cancel,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub(crate) fn source_name(&self) -> Option<String> {
        self.state.source_name.lock().clone()
    }

    pub(crate) fn clock_offset(&self) -> Option<ClockOffset> {
        *self.state.clock_offset.lock()
    }

    /// Queues metadata for the source. Sent once the handshake completes.
    pub(crate) fn send_metadata(&self, frame: MetadataFrame) {
        self.upstream.push(Message::Metadata(frame).encode());
    }

    /// Says goodbye and stops reading. Pending metadata is discarded.
    pub(crate) fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.upstream.drop_media();
        self.upstream.push(Message::Bye.encode());
        self.upstream.close();
        self.cancel.cancel();
        self.state.connected.store(false, Ordering::Release);
        tracing::debug!(peer = %self.addr, "closing link");
    }
}

impl Drop for InboundLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    config: Config,
    addr: SocketAddr,
    upstream: Arc<OutboundQueue>,
    state: Arc<LinkState>,
    cancel: CancellationToken,
    sink: Arc<dyn LinkSink>,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = session(&config, addr, &upstream, &state, sink.as_ref()) => result,
    };
    state.connected.store(false, Ordering::Release);
    upstream.close();
    match result {
        Ok(()) => tracing::debug!(%addr, "link closed"),
        Err(e) => {
            if !cancel.is_cancelled() {
                tracing::debug!(%addr, error = %e, "link failed");
                sink.disconnected(e);
            }
        }
    }
}

async fn session(
    config: &Config,
    addr: SocketAddr,
    upstream: &Arc<OutboundQueue>,
    state: &LinkState,
    sink: &dyn LinkSink,
) -> Result<()> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::Transport(format!(
                "Connecting to {addr} timed out after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|e| Error::Transport(format!("Connecting to {addr} failed: {e}")))?;
    stream.set_nodelay(config.tcp_nodelay)?;

    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, FrameCodec);
    tokio::spawn(write_loop(
        addr,
        upstream.clone(),
        FramedWrite::new(write, FrameCodec),
    ));

    let first = match tokio::time::timeout(config.connect_timeout, reader.next()).await {
        Err(_) => {
            return Err(Error::Transport(format!(
                "No handshake reply from {addr} within {:?}",
                config.connect_timeout
            )))
        }
        Ok(None) => {
            return Err(Error::Transport(format!(
                "{addr} closed the connection during the handshake"
            )))
        }
        Ok(Some(raw)) => raw?,
    };
    let source_name = match Message::decode(&first)? {
        Message::Welcome { source_name, .. } => source_name,
        Message::Reject { reason } => {
            return Err(Error::Transport(format!("Connection rejected: {reason}")))
        }
        other => {
            return Err(Error::Transport(format!(
                "Expected Welcome, received {:?}",
                other.kind()
            )))
        }
    };

    *state.source_name.lock() = Some(source_name.clone());
    state.connected.store(true, Ordering::Release);
    tracing::info!(source = %source_name, %addr, "connected to source");
    sink.connected(&source_name);

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let next = tokio::select! {
            _ = ping.tick() => {
                upstream.push(Message::Ping { t1: PtpTimestamp::now() }.encode());
                continue;
            }
            next = reader.next() => next,
        };
        let raw = match next {
            None => {
                return Err(Error::Transport(format!(
                    "Source '{source_name}' closed the connection"
                )))
            }
            Some(raw) => raw?,
        };
        match raw.kind {
            kind if kind.is_media() => sink.message(raw),
            MessageKind::Pong => {
                if let Message::Pong { t1, t2, t3 } = Message::decode(&raw)? {
                    let offset = ClockOffset::from_exchange(t1, t2, t3, PtpTimestamp::now());
                    tracing::trace!(offset_ns = offset.offset_ns, "clock offset updated");
                    *state.clock_offset.lock() = Some(offset);
                }
            }
            MessageKind::Bye => {
                return Err(Error::Transport(format!(
                    "Source '{source_name}' ended the session"
                )))
            }
            kind => tracing::trace!(?kind, "ignoring message"),
        }
    }
}

async fn write_loop(
    addr: SocketAddr,
    upstream: Arc<OutboundQueue>,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
) {
    while let Some(message) = upstream.next().await {
        if let Err(e) = writer.send(message).await {
            tracing::debug!(%addr, error = %e, "upstream write failed");
            break;
        }
    }
}
