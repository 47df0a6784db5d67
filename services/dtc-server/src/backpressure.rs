//! Backpressure and flow control for session writers
//!
//! Each session owns a bounded outbound queue of encoded frames. Pushing
//! never blocks the publisher: when the queue is full the oldest frame is
//! dropped and counted, and the count is reported to the client in the next
//! server heartbeat.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of pushing a frame onto an [`OutboundQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// The queue is closed; the frame was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Bytes>,
    messages_dropped: u64,
    is_lagging: bool,
    closed: bool,
}

/// Per-session outbound queue with bounded capacity and drop-oldest policy.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity.min(1024)),
                ..QueueState::default()
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame and wake the writer.
    pub fn push(&self, frame: Bytes) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.messages_dropped += 1;
                state.is_lagging = true;
                outcome = PushOutcome::DroppedOldest;
            }
            state.frames.push_back(frame);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Take everything queued, in push order.
    pub fn drain(&self) -> Vec<Bytes> {
        let mut state = self.state.lock();
        state.is_lagging = false;
        state.frames.drain(..).collect()
    }

    /// Wait until a push (or close) happens after the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Refuse further pushes. Frames already queued stay drainable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted from this queue.
    pub fn messages_dropped(&self) -> u64 {
        self.state.lock().messages_dropped
    }

    /// Whether the queue overflowed since the writer last drained it.
    pub fn is_lagging(&self) -> bool {
        self.state.lock().is_lagging
    }
}
