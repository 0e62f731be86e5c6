use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::watch,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use super::{
    codec::{FrameCodec, Message, MessageKind, RawMessage, PROTOCOL_VERSION},
    queue::{FrameQueue, OutboundQueue},
};
use crate::{
    clock::PtpTimestamp,
    frames::{MetadataFrame, Tally},
    receiver::Bandwidth,
    runtime, Config, Error, Result,
};

/// One accepted receiver.
struct Connection {
    id: u64,
    peer: SocketAddr,
    bandwidth: Bandwidth,
    queue: OutboundQueue,
    tally: Mutex<Tally>,
    video_frames: AtomicU64,
}

impl Connection {
    /// Applies the receiver's bandwidth tier to an outgoing message.
    fn accepts(&self, kind: MessageKind) -> bool {
        match (kind, self.bandwidth) {
            (MessageKind::Video, Bandwidth::Highest) => true,
            (MessageKind::Video, Bandwidth::Lowest) => {
                self.video_frames.fetch_add(1, Ordering::Relaxed) % 2 == 0
            }
            (MessageKind::Video, _) => false,
            (MessageKind::Audio, Bandwidth::MetadataOnly) => false,
            _ => true,
        }
    }
}

struct HubShared {
    config: Config,
    source_name: String,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
    tally: watch::Sender<Tally>,
    connection_metadata: Mutex<Vec<MetadataFrame>>,
    inbound_metadata: FrameQueue<MetadataFrame>,
    cancel: CancellationToken,
}

/// Listener and per-connection writers for one advertised source.
pub(crate) struct OutboundHub {
    shared: Arc<HubShared>,
    handle: Handle,
    port: u16,
}

impl OutboundHub {
    /// Binds an ephemeral TCP port and starts accepting receivers on `handle`.
    pub(crate) fn bind(handle: &Handle, config: &Config, source_name: &str) -> Result<Self> {
        let listener = {
            let _guard = handle.enter();
            let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            listener.set_nonblocking(true)?;
            TcpListener::from_std(listener)?
        };
        let port = listener.local_addr()?.port();

        let (count, _) = watch::channel(0);
        let (tally, _) = watch::channel(Tally::default());
        let shared = Arc::new(HubShared {
            config: config.clone(),
            source_name: source_name.to_owned(),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            count,
            tally,
            connection_metadata: Mutex::new(Vec::new()),
            inbound_metadata: FrameQueue::new(config.metadata_queue_depth, "metadata", "sender"),
            cancel: CancellationToken::new(),
        });
        handle.spawn(accept_loop(shared.clone(), listener));

        tracing::info!(source = %source_name, port, "listening for receivers");
        Ok(Self {
            shared,
            handle: handle.clone(),
            port,
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Queues a message for every connection whose bandwidth tier accepts it.
    pub(crate) fn broadcast(&self, message: RawMessage) {
        let connections = self.shared.connections.lock();
        for connection in connections.values() {
            if connection.accepts(message.kind) {
                connection.queue.push(message.clone());
            }
        }
    }

    pub(crate) fn connections(&self) -> usize {
        *self.shared.count.borrow()
    }

    pub(crate) async fn wait_for_connections(&self, timeout: Duration) -> bool {
        let mut count = self.shared.count.subscribe();
        let ready = matches!(
            runtime::timeout(&self.handle, timeout, count.wait_for(|n| *n > 0)).await,
            Some(Ok(_))
        );
        ready
    }

    pub(crate) fn tally(&self) -> Tally {
        *self.shared.tally.borrow()
    }

    pub(crate) fn subscribe_tally(&self) -> watch::Receiver<Tally> {
        self.shared.tally.subscribe()
    }

    /// Registers metadata for every future connection and sends it to the
    /// current ones.
    pub(crate) fn add_connection_metadata(&self, frame: MetadataFrame) {
        let mut registered = self.shared.connection_metadata.lock();
        self.broadcast(Message::Metadata(frame.clone()).encode());
        registered.push(frame);
    }

    pub(crate) fn clear_connection_metadata(&self) {
        self.shared.connection_metadata.lock().clear();
    }

    /// Next metadata frame sent upstream by a receiver.
    pub(crate) async fn metadata(&self, timeout: Duration) -> Result<MetadataFrame> {
        self.shared.inbound_metadata.pop(&self.handle, timeout).await
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.shared
            .connections
            .lock()
            .values()
            .map(|c| c.queue.dropped())
            .sum()
    }

    /// Drops pending media, says goodbye to every receiver and waits up to
    /// `grace` for them to disconnect.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.say_goodbye();
        let mut count = self.shared.count.subscribe();
        let _ = runtime::timeout(&self.handle, grace, count.wait_for(|n| *n == 0)).await;
        self.abort();
    }

    /// Stops accepting and closes every connection without waiting.
    pub(crate) fn abort(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.say_goodbye();
        self.shared.cancel.cancel();
        self.shared.inbound_metadata.close();
        tracing::debug!(source = %self.shared.source_name, "hub closed");
    }
}

impl Drop for OutboundHub {
    fn drop(&mut self) {
        self.abort();
    }
}

impl HubShared {
    fn register(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.lock();
        connections.insert(connection.id, connection);
        self.count.send_replace(connections.len());
    }

    fn unregister(&self, id: u64) {
        let removed = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(&id).is_some();
            self.count.send_replace(connections.len());
            removed
        };
        if removed {
            self.update_tally();
        }
    }

    fn update_tally(&self) {
        let aggregate = self
            .connections
            .lock()
            .values()
            .fold(Tally::default(), |acc, c| acc.merge(*c.tally.lock()));
        self.tally.send_if_modified(|current| {
            if *current == aggregate {
                false
            } else {
                *current = aggregate;
                true
            }
        });
    }

    fn say_goodbye(&self) {
        let bye = Message::Bye.encode();
        for connection in self.connections.lock().values() {
            connection.queue.drop_media();
            connection.queue.push(bye.clone());
            connection.queue.close();
        }
    }

    fn on_metadata(&self, connection: &Connection, frame: MetadataFrame) {
        match Tally::from_metadata(&frame) {
            Some(tally) => {
                *connection.tally.lock() = tally;
                self.update_tally();
            }
            None => {
                if !self.inbound_metadata.push(frame) {
                    tracing::trace!(peer = %connection.peer, "receiver metadata dropped");
                }
            }
        }
    }
}

async fn accept_loop(shared: Arc<HubShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(&shared, stream, peer).await {
                        tracing::debug!(%peer, error = %e, "receiver connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve(shared: &Arc<HubShared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(shared.config.tcp_nodelay)?;
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, FrameCodec);
    let mut writer = FramedWrite::new(write, FrameCodec);

    let timeout = shared.config.connect_timeout;
    let first = match tokio::time::timeout(timeout, reader.next()).await {
        Err(_) => {
            return Err(Error::Timeout {
                operation: "handshake",
                timeout,
            })
        }
        Ok(None) => return Ok(()),
        Ok(Some(raw)) => raw?,
    };
    let hello = match Message::decode(&first)? {
        Message::Hello(hello) => hello,
        other => {
            return Err(Error::Transport(format!(
                "Expected Hello, received {:?}",
                other.kind()
            )))
        }
    };
    if hello.version != PROTOCOL_VERSION {
        let reason = format!(
            "Protocol version {} is not supported (expected {PROTOCOL_VERSION})",
            hello.version
        );
        writer
            .send(Message::Reject {
                reason: reason.clone(),
            }
            .encode())
            .await?;
        return Err(Error::Transport(reason));
    }

    let bandwidth = Bandwidth::try_from(hello.bandwidth).unwrap_or(Bandwidth::Highest);
    let connection = Arc::new(Connection {
        id: shared.next_id.fetch_add(1, Ordering::Relaxed),
        peer,
        bandwidth,
        queue: OutboundQueue::new(
            shared.config.audio_queue_depth,
            shared.config.metadata_queue_depth,
        ),
        tally: Mutex::new(Tally::default()),
        video_frames: AtomicU64::new(0),
    });
    connection.queue.push(
        Message::Welcome {
            version: PROTOCOL_VERSION,
            source_name: shared.source_name.clone(),
        }
        .encode(),
    );
    {
        let registered = shared.connection_metadata.lock();
        for frame in registered.iter() {
            connection.queue.push(Message::Metadata(frame.clone()).encode());
        }
        shared.register(connection.clone());
    }
    if shared.cancel.is_cancelled() {
        connection.queue.close();
    }
    tracing::info!(
        source = %shared.source_name,
        %peer,
        receiver = %hello.receiver_name,
        ?bandwidth,
        "receiver connected"
    );

    let writer_task = tokio::spawn(write_loop(connection.clone(), writer));

    let result = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break Ok(()),
            next = reader.next() => next,
        };
        let raw = match next {
            None => break Ok(()),
            Some(Err(e)) => break Err(e),
            Some(Ok(raw)) => raw,
        };
        match Message::decode(&raw) {
            Ok(Message::Ping { t1 }) => {
                let t2 = PtpTimestamp::now();
                connection.queue.push(
                    Message::Pong {
                        t1,
                        t2,
                        t3: PtpTimestamp::now(),
                    }
                    .encode(),
                );
            }
            Ok(Message::Metadata(frame)) => shared.on_metadata(&connection, frame),
            Ok(Message::Bye) => break Ok(()),
            Ok(other) => tracing::trace!(%peer, kind = ?other.kind(), "ignoring message"),
            Err(e) => break Err(e),
        }
    };

    shared.unregister(connection.id);
    connection.queue.close();
    if let Err(e) = writer_task.await {
        tracing::warn!(source = %shared.source_name, %peer, error = %e, "writer task failed");
    }
    tracing::info!(source = %shared.source_name, %peer, "receiver disconnected");
    result
}

async fn write_loop(
    connection: Arc<Connection>,
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
) {
    while let Some(message) = connection.queue.next().await {
        if let Err(e) = writer.send(message).await {
            tracing::debug!(peer = %connection.peer, error = %e, "write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(bandwidth: Bandwidth) -> Connection {
        Connection {
            id: 1,
            peer: "127.0.0.1:1".parse().unwrap(),
            bandwidth,
            queue: OutboundQueue::new(4, 4),
            tally: Mutex::new(Tally::default()),
            video_frames: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_metadata_only_tier() {
        let c = connection(Bandwidth::MetadataOnly);
        assert!(c.accepts(MessageKind::Metadata));
        assert!(!c.accepts(MessageKind::Audio));
        assert!(!c.accepts(MessageKind::Video));
        assert!(c.accepts(MessageKind::Bye));
    }

    #[test]
    fn test_audio_only_tier() {
        let c = connection(Bandwidth::AudioOnly);
        assert!(c.accepts(MessageKind::Audio));
        assert!(!c.accepts(MessageKind::Video));
    }

    #[test]
    fn test_lowest_tier_halves_video() {
        let c = connection(Bandwidth::Lowest);
        let sent = (0..10).filter(|_| c.accepts(MessageKind::Video)).count();
        assert_eq!(sent, 5);
        assert!(c.accepts(MessageKind::Audio));
    }

    #[test]
    fn test_highest_tier_sends_everything() {
        let c = connection(Bandwidth::Highest);
        assert!((0..10).all(|_| c.accepts(MessageKind::Video)));
    }
}
