//! Per-process console fan-out.
//!
//! Each process id owns one [`LogBuffer`] plus a registry of viewer delivery
//! queues. Append and fan-out happen under a single per-process lock, so
//! sequence assignment is serialized and every viewer sees entries in
//! append order. Delivery never waits: a viewer whose queue is full is
//! dropped, which closes its stream and makes it resume from its last
//! sequence number on reconnect.

use super::log_buffer::LogBuffer;
use super::recording::{ConsoleRecorder, Recording};
use panel_core::LogEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default retained entries per process.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Default per-viewer queue depth.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

struct ChannelState {
    buffer: LogBuffer,
    subscribers: HashMap<u64, mpsc::Sender<LogEntry>>,
}

/// Console state for a single process id.
struct ConsoleChannel {
    process_id: String,
    state: Mutex<ChannelState>,
}

impl ConsoleChannel {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct HubInner {
    channels: RwLock<HashMap<String, Arc<ConsoleChannel>>>,
    buffer_capacity: usize,
    subscriber_queue: usize,
    next_subscriber: AtomicU64,
    recorder: Option<ConsoleRecorder>,
}

/// Shared console hub. Cheap to clone.
#[derive(Clone)]
pub struct ConsoleHub {
    inner: Arc<HubInner>,
}

impl ConsoleHub {
    /// Create a hub retaining `buffer_capacity` entries per process and
    /// queueing at most `subscriber_queue` entries per viewer.
    pub fn new(buffer_capacity: usize, subscriber_queue: usize) -> Self {
        Self::build(buffer_capacity, subscriber_queue, None)
    }

    /// Same as [`ConsoleHub::new`], additionally mirroring every entry to disk.
    pub fn with_recorder(
        buffer_capacity: usize,
        subscriber_queue: usize,
        recorder: ConsoleRecorder,
    ) -> Self {
        Self::build(buffer_capacity, subscriber_queue, Some(recorder))
    }

    fn build(
        buffer_capacity: usize,
        subscriber_queue: usize,
        recorder: Option<ConsoleRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: RwLock::new(HashMap::new()),
                buffer_capacity: buffer_capacity.max(1),
                subscriber_queue: subscriber_queue.max(1),
                next_subscriber: AtomicU64::new(1),
                recorder,
            }),
        }
    }

    /// Get or lazily create the channel for a process id.
    fn channel(&self, process_id: &str) -> Arc<ConsoleChannel> {
        {
            let channels = self
                .inner
                .channels
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(channel) = channels.get(process_id) {
                return channel.clone();
            }
        }

        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(process_id.to_string())
            .or_insert_with(|| {
                debug!(process_id, "console buffer created");
                Arc::new(ConsoleChannel {
                    process_id: process_id.to_string(),
                    state: Mutex::new(ChannelState {
                        buffer: LogBuffer::new(self.inner.buffer_capacity),
                        subscribers: HashMap::new(),
                    }),
                })
            })
            .clone()
    }

    /// Append a line to a process's console and fan it out to every viewer.
    pub fn append(&self, process_id: &str, line: impl Into<String>) -> LogEntry {
        let channel = self.channel(process_id);
        let mut state = channel.lock();
        let entry = state.buffer.append(line.into());

        state.subscribers.retain(|id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    process_id,
                    subscriber = id,
                    seq = entry.seq,
                    "viewer queue full, dropping subscriber"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(process_id, subscriber = id, "viewer gone, pruning");
                false
            }
        });

        if let Some(recorder) = &self.inner.recorder {
            recorder.record(process_id, &entry);
        }

        entry
    }

    /// Register a viewer and compute its snapshot atomically with respect
    /// to `append`, so nothing falls between snapshot and live delivery.
    pub fn subscribe(&self, process_id: &str, last_seq: u64) -> Subscription {
        let channel = self.channel(process_id);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.subscriber_queue);

        let resume = {
            let mut state = channel.lock();
            let resume = state.buffer.since(last_seq);
            state.subscribers.insert(id, tx);
            resume
        };

        debug!(
            process_id,
            subscriber = id,
            last_seq,
            reset = resume.reset,
            entries = resume.entries.len(),
            "viewer subscribed"
        );

        Subscription {
            snapshot: resume.entries,
            reset: resume.reset,
            receiver: rx,
            guard: SubscriptionGuard {
                channel,
                id,
                active: true,
            },
        }
    }

    /// Seed a process's buffer from recorded history.
    pub fn restore(&self, process_id: &str, recording: Recording) {
        let channel = self.channel(process_id);
        let mut state = channel.lock();
        state.buffer.restore(recording.entries, recording.high_water);
        debug!(
            process_id,
            newest_seq = state.buffer.newest_seq(),
            "console buffer restored"
        );
    }

    /// Number of live viewers of a process.
    pub fn subscriber_count(&self, process_id: &str) -> usize {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .get(process_id)
            .map(|c| c.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Highest sequence assigned for a process (0 if none).
    pub fn newest_seq(&self, process_id: &str) -> u64 {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .get(process_id)
            .map(|c| c.lock().buffer.newest_seq())
            .unwrap_or(0)
    }

    /// Flush the recorder, if any, and mark its files cleanly closed.
    pub async fn close_recording(&self) {
        if let Some(recorder) = &self.inner.recorder {
            recorder.close().await;
        }
    }
}

/// A viewer's registration: base state plus the live queue.
pub struct Subscription {
    pub snapshot: Vec<LogEntry>,
    pub reset: bool,
    pub receiver: mpsc::Receiver<LogEntry>,
    pub guard: SubscriptionGuard,
}

/// Deregisters the viewer when unsubscribed or dropped.
pub struct SubscriptionGuard {
    channel: Arc<ConsoleChannel>,
    id: u64,
    active: bool,
}

impl SubscriptionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the viewer's queue from the hub. Idempotent; safe from any task.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let removed = self.channel.lock().subscribers.remove(&self.id).is_some();
        debug!(
            process_id = %self.channel.process_id,
            subscriber = self.id,
            removed,
            "viewer unsubscribed"
        );
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
