//! Progress fan-out to subscribers, one topic per batch.
//!
//! The broadcaster is an observer: publishing never blocks and never fails,
//! so a batch advances and finalizes whether or not anyone is listening.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use framemover_core::{BatchId, BatchProgress};

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressFrame {
    /// Latest progress of the batch.
    Snapshot(BatchProgress),
    /// Liveness check; carries no progress.
    Heartbeat { batch_id: BatchId, at: DateTime<Utc> },
}

impl ProgressFrame {
    /// Serialize the frame for a wire transport.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The progress snapshot, if this is not a heartbeat.
    pub fn snapshot(&self) -> Option<&BatchProgress> {
        match self {
            Self::Snapshot(progress) => Some(progress),
            Self::Heartbeat { .. } => None,
        }
    }
}

/// Receiving end of a batch subscription.
///
/// The first frame is always the current snapshot. The subscription ends
/// after the batch's terminal snapshot, or when the subscriber is dropped
/// for missing heartbeats.
#[derive(Debug)]
pub struct Subscription {
    batch_id: BatchId,
    rx: mpsc::Receiver<ProgressFrame>,
}

impl Subscription {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Next frame, or None once the subscription has ended.
    pub async fn recv(&mut self) -> Option<ProgressFrame> {
        self.rx.recv().await
    }

    /// Next progress snapshot, skipping heartbeats.
    pub async fn next_snapshot(&mut self) -> Option<BatchProgress> {
        while let Some(frame) = self.rx.recv().await {
            if let ProgressFrame::Snapshot(progress) = frame {
                return Some(progress);
            }
        }
        None
    }

    /// Convert into a `Stream` of frames.
    pub fn into_stream(self) -> ReceiverStream<ProgressFrame> {
        ReceiverStream::new(self.rx)
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressFrame>,
    /// Frames accepted into the channel so far.
    sent: u64,
    /// Frames the receiver had taken at the previous heartbeat.
    consumed_at_beat: u64,
    missed: u32,
}

impl Subscriber {
    fn try_deliver(&mut self, frame: ProgressFrame) -> Result<(), TrySendError<ProgressFrame>> {
        self.tx.try_send(frame)?;
        self.sent += 1;
        Ok(())
    }

    /// Frames the receiver has taken off the channel.
    fn consumed(&self) -> u64 {
        let queued = self.tx.max_capacity().saturating_sub(self.tx.capacity()) as u64;
        self.sent.saturating_sub(queued)
    }
}

#[derive(Debug)]
struct Topic {
    latest: BatchProgress,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    topics: DashMap<BatchId, Topic>,
    buffer: usize,
    max_missed: u32,
    next_subscriber: AtomicU64,
}

/// Publish/subscribe hub for batch progress.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    inner: Arc<Inner>,
}

impl ProgressBroadcaster {
    /// Create a broadcaster with a per-subscriber buffer and heartbeat tolerance.
    pub fn new(buffer: usize, max_missed_heartbeats: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                buffer: buffer.max(1),
                max_missed: max_missed_heartbeats.max(1),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Push a snapshot to every subscriber of its batch.
    ///
    /// A terminal snapshot closes the topic: subscribers receive it and
    /// their stream then ends.
    pub fn publish(&self, progress: BatchProgress) {
        let batch_id = progress.batch_id;
        let terminal = progress.is_terminal();
        let mut topic = self.inner.topics.entry(batch_id).or_insert_with(|| Topic {
            latest: progress.clone(),
            subscribers: Vec::new(),
            closed: false,
        });
        if topic.closed {
            return;
        }
        topic.latest = progress.clone();

        let frame = ProgressFrame::Snapshot(progress);
        topic.subscribers.retain_mut(|subscriber| {
            match subscriber.try_deliver(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(frame)) => {
                    if terminal {
                        deliver_later(subscriber.tx.clone(), frame);
                    }
                    // A lagging subscriber catches up on the next snapshot.
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(batch = %batch_id, subscriber = subscriber.id, "subscriber disconnected");
                    false
                }
            }
        });

        if terminal {
            topic.closed = true;
            topic.subscribers.clear();
        }
    }

    /// Register a subscriber for a batch.
    ///
    /// Returns None for unknown batches. A subscriber to a finished batch
    /// receives the final snapshot and nothing else.
    pub fn subscribe(&self, batch_id: BatchId) -> Option<Subscription> {
        let mut topic = self.inner.topics.get_mut(&batch_id)?;
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        // Fresh channel with capacity >= 1: cannot fail.
        let _ = tx.try_send(ProgressFrame::Snapshot(topic.latest.clone()));

        if !topic.closed {
            let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
            topic.subscribers.push(Subscriber {
                id,
                tx,
                sent: 1,
                consumed_at_beat: 0,
                missed: 0,
            });
            debug!(batch = %batch_id, subscriber = id, "subscriber registered");
        }

        Some(Subscription { batch_id, rx })
    }

    /// Drop a batch's topic. Current subscribers see their stream end.
    pub fn remove(&self, batch_id: BatchId) {
        if self.inner.topics.remove(&batch_id).is_some() {
            trace!(batch = %batch_id, "topic removed");
        }
    }

    /// Latest snapshot for polling clients.
    pub fn latest(&self, batch_id: BatchId) -> Option<BatchProgress> {
        self.inner
            .topics
            .get(&batch_id)
            .map(|topic| topic.latest.clone())
    }

    /// Number of live subscribers for a batch.
    pub fn subscriber_count(&self, batch_id: BatchId) -> usize {
        self.inner
            .topics
            .get(&batch_id)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }

    /// Send one heartbeat to every subscriber of every open topic.
    ///
    /// A beat is missed when the subscriber's buffer is full and it has
    /// taken nothing off it since the previous beat. A subscriber that
    /// misses `max_missed_heartbeats` consecutive beats is dropped; one that
    /// reads, however slowly, is kept.
    pub fn heartbeat(&self) {
        let max_missed = self.inner.max_missed;
        let now = Utc::now();

        for mut topic in self.inner.topics.iter_mut() {
            let batch_id = *topic.key();
            if topic.closed {
                continue;
            }
            topic.subscribers.retain_mut(|subscriber| {
                let consumed = subscriber.consumed();
                let reading = consumed > subscriber.consumed_at_beat;
                subscriber.consumed_at_beat = consumed;

                match subscriber.try_deliver(ProgressFrame::Heartbeat { batch_id, at: now }) {
                    Ok(()) => {
                        subscriber.missed = 0;
                        true
                    }
                    Err(TrySendError::Full(_)) if reading => {
                        subscriber.missed = 0;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        subscriber.missed += 1;
                        if subscriber.missed >= max_missed {
                            debug!(
                                batch = %batch_id,
                                subscriber = subscriber.id,
                                missed = subscriber.missed,
                                "dropping unresponsive subscriber"
                            );
                            return false;
                        }
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    /// Spawn the periodic heartbeat task.
    ///
    /// The task stops by itself once every broadcaster handle is dropped.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ProgressBroadcaster { inner }.heartbeat();
            }
        })
    }
}

/// Deliver a terminal frame to a momentarily full subscriber without blocking the publisher.
fn deliver_later(tx: mpsc::Sender<ProgressFrame>, frame: ProgressFrame) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = tokio::time::timeout(Duration::from_secs(30), tx.send(frame)).await;
        });
    }
}
