//! Bounded frame queues between the worker runtime and session callers.
//!
//! Nothing here buffers without bound: when a queue is full the oldest
//! entry is evicted and counted as dropped.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::Notify, time::Instant};

use super::codec::{MessageKind, RawMessage};
use crate::{runtime, Error, Result};

struct QueueState<T> {
    items: VecDeque<T>,
    dropped: u64,
    failure: Option<Error>,
    closed: bool,
}

/// Single-consumer queue that a worker task fills and a session pulls from.
///
/// Queued items are drained before a recorded failure is reported, and a
/// failure is reported on every pull after that.
pub(crate) struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    operation: &'static str,
    owner: &'static str,
}

impl<T> FrameQueue<T> {
    /// `capacity` of 1 gives newest-wins behaviour.
    pub(crate) fn new(capacity: usize, operation: &'static str, owner: &'static str) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                dropped: 0,
                failure: None,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            operation,
            owner,
        }
    }

    /// Queues an item, evicting the oldest one if the queue is full.
    /// Returns `false` if something was evicted.
    pub(crate) fn push(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return true;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        !evicted
    }

    /// Records a session failure. Only the first failure is kept.
    pub(crate) fn fail(&self, error: Error) {
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(error);
            }
        }
        self.notify.notify_one();
    }

    /// Marks the queue closed and discards its contents.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub(crate) fn try_pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed(self.owner));
        }
        if let Some(item) = state.items.pop_front() {
            return Ok(Some(item));
        }
        match &state.failure {
            Some(error) => Err(error.duplicate()),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout` for an item, timed on `timer`. A zero timeout
    /// only checks what is already queued.
    pub(crate) async fn pop(&self, timer: &Handle, timeout: Duration) -> Result<T> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop()? {
                return Ok(item);
            }
            if timeout.is_zero() {
                return Err(self.timeout_error(timeout));
            }
            match deadline {
                Some(deadline) => {
                    if runtime::timeout_at(timer, deadline, notified).await.is_none() {
                        return match self.try_pop()? {
                            Some(item) => Ok(item),
                            None => Err(self.timeout_error(timeout)),
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    fn timeout_error(&self, timeout: Duration) -> Error {
        Error::Timeout {
            operation: self.operation,
            timeout,
        }
    }
}

#[derive(Default)]
struct OutboundState {
    control: VecDeque<RawMessage>,
    video: Option<RawMessage>,
    audio: VecDeque<RawMessage>,
    metadata: VecDeque<RawMessage>,
    dropped: u64,
    closed: bool,
}

/// Per-connection send queue.
///
/// Pending video is newest-wins; audio and metadata are bounded FIFOs;
/// control messages are never dropped. Control goes out first, then
/// metadata, audio and video.
pub(crate) struct OutboundQueue {
    state: Mutex<OutboundState>,
    notify: Notify,
    audio_depth: usize,
    metadata_depth: usize,
}

impl OutboundQueue {
    pub(crate) fn new(audio_depth: usize, metadata_depth: usize) -> Self {
        Self {
            state: Mutex::new(OutboundState::default()),
            notify: Notify::new(),
            audio_depth: audio_depth.max(1),
            metadata_depth: metadata_depth.max(1),
        }
    }

    pub(crate) fn push(&self, message: RawMessage) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let kind = message.kind;
            let dropped = match kind {
                MessageKind::Video => state.video.replace(message).is_some(),
                MessageKind::Audio => {
                    push_bounded(&mut state.audio, message, self.audio_depth)
                }
                MessageKind::Metadata => {
                    push_bounded(&mut state.metadata, message, self.metadata_depth)
                }
                _ => {
                    state.control.push_back(message);
                    false
                }
            };
            if dropped {
                state.dropped += 1;
                tracing::trace!(dropped = state.dropped, "outbound frame replaced");
            }
        }
        self.notify.notify_one();
    }

    /// Discards pending media. Control messages stay queued.
    pub(crate) fn drop_media(&self) {
        let mut state = self.state.lock();
        state.video = None;
        state.audio.clear();
        state.metadata.clear();
    }

    /// Stops accepting messages. Already queued messages are still handed
    /// out by [`next`](Self::next).
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Next message to write, or `None` once closed and drained.
    pub(crate) async fn next(&self) -> Option<RawMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let next = state
                    .control
                    .pop_front()
                    .or_else(|| state.metadata.pop_front())
                    .or_else(|| state.audio.pop_front())
                    .or_else(|| state.video.take());
                if next.is_some() {
                    return next;
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

fn push_bounded(lane: &mut VecDeque<RawMessage>, message: RawMessage, depth: usize) -> bool {
    let evicted = if lane.len() >= depth {
        lane.pop_front();
        true
    } else {
        false
    };
    lane.push_back(message);
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raw(kind: MessageKind, tag: u8) -> RawMessage {
        RawMessage::new(kind, Bytes::from(vec![tag]))
    }

    #[tokio::test]
    async fn test_zero_timeout_on_empty_queue() {
        let queue: FrameQueue<u32> = FrameQueue::new(1, "video frame", "receiver");
        let err = queue.pop(&Handle::current(), Duration::ZERO).await.unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_newest_wins() {
        let queue = FrameQueue::new(1, "video frame", "receiver");
        assert!(queue.push(1));
        assert!(!queue.push(2));
        assert_eq!(queue.pop(&Handle::current(), Duration::ZERO).await.unwrap(), 2);
        assert_eq!(queue.dropped(), 1);
        assert!(queue.pop(&Handle::current(), Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_bounded_fifo_evicts_oldest() {
        let queue = FrameQueue::new(3, "audio frame", "receiver");
        for i in 0..5 {
            queue.push(i);
        }
        let mut got = Vec::new();
        while let Ok(Some(item)) = queue.try_pop() {
            got.push(item);
        }
        assert_eq!(got, vec![2, 3, 4]);
        assert_eq!(queue.dropped(), 2);
    }

    #[tokio::test]
    async fn test_failure_reported_after_drain() {
        let queue = FrameQueue::new(4, "audio frame", "receiver");
        queue.push(7);
        queue.fail(Error::Transport("connection reset".into()));
        assert_eq!(queue.pop(&Handle::current(), Duration::ZERO).await.unwrap(), 7);
        for _ in 0..2 {
            let err = queue.pop(&Handle::current(), Duration::from_millis(10)).await.unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = FrameQueue::new(1, "video frame", "receiver");
        queue.push(1);
        queue.close();
        let err = queue.pop(&Handle::current(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(FrameQueue::new(1, "video frame", "receiver"));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push(99);
        });
        assert_eq!(queue.pop(&Handle::current(), Duration::from_secs(5)).await.unwrap(), 99);
    }

    /// The timer lives on the given runtime, not on the caller's executor.
    #[test]
    fn test_pop_outside_tokio() {
        let timer = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();

        let queue: FrameQueue<u8> = FrameQueue::new(1, "video frame", "receiver");
        let err = futures::executor::block_on(queue.pop(timer.handle(), Duration::from_millis(20)))
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");

        queue.push(5);
        let item = futures::executor::block_on(queue.pop(timer.handle(), Duration::from_secs(1)));
        assert_eq!(item.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out() {
        let queue: FrameQueue<u8> = FrameQueue::new(1, "video frame", "receiver");
        let err = queue.pop(&Handle::current(), Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                operation: "video frame",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_outbound_priorities_and_newest_video() {
        let queue = OutboundQueue::new(2, 2);
        queue.push(raw(MessageKind::Video, 1));
        queue.push(raw(MessageKind::Video, 2));
        queue.push(raw(MessageKind::Audio, 3));
        queue.push(raw(MessageKind::Metadata, 4));
        queue.push(raw(MessageKind::Pong, 5));

        let mut order = Vec::new();
        queue.close();
        while let Some(message) = queue.next().await {
            order.push(message.payload[0]);
        }
        assert_eq!(order, vec![5, 4, 3, 2]);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_outbound_drop_media_keeps_control() {
        let queue = OutboundQueue::new(4, 4);
        queue.push(raw(MessageKind::Audio, 1));
        queue.push(raw(MessageKind::Video, 2));
        queue.push(raw(MessageKind::Bye, 3));
        queue.drop_media();
        queue.close();
        queue.push(raw(MessageKind::Metadata, 4));

        let first = queue.next().await.unwrap();
        assert_eq!(first.kind, MessageKind::Bye);
        assert!(queue.next().await.is_none());
    }
}
