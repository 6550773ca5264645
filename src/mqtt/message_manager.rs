use super::config::{OverflowPolicy, QueueConfig};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// One pending publish, derived from exactly one feed element.
#[derive(Clone)]
pub struct PublishIntent {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
    pub created: DateTime<Local>,
}

impl PublishIntent {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retained,
            created: Local::now(),
        }
    }
}

// Two intents are the same publish regardless of when they were created
impl PartialEq for PublishIntent {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic
            && self.payload == other.payload
            && self.retained == other.retained
    }
}

impl Eq for PublishIntent {}

impl fmt::Display for PublishIntent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(48).collect();
        let ellipsis = if preview.len() < text.len() { "..." } else { "" };
        let kind = if self.retained { "retained" } else { "normal" };
        write!(f, "{} {} - {}{}", kind, self.topic, preview, ellipsis)
    }
}

impl fmt::Debug for PublishIntent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PublishIntent")
            .field("topic", &self.topic)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("retained", &self.retained)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the returned intent was evicted to make room
    DroppedOldest(PublishIntent),
    Closed,
}

#[derive(Default)]
struct QueueState {
    intents: VecDeque<PublishIntent>,
    dropped: u64,
    high_water: usize,
    closed: bool,
}

/// Bounded FIFO between the feed task and the publish task.
///
/// The lock is only held for queue bookkeeping, never across an await.
pub struct IntentQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    overflow: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl IntentQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: config.capacity.max(1),
            overflow: config.overflow,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an intent. With [`OverflowPolicy::Block`] this waits for room.
    pub async fn push(&self, intent: PublishIntent) -> PushOutcome {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }

                let evicted = if state.intents.len() < self.capacity {
                    None
                } else if self.overflow == OverflowPolicy::DropOldest {
                    // Keep queued root tags; children are what gets shed
                    let index = state
                        .intents
                        .iter()
                        .position(|queued| !queued.retained)
                        .unwrap_or(0);
                    state.dropped += 1;
                    state.intents.remove(index)
                } else {
                    None
                };

                if state.intents.len() < self.capacity {
                    state.intents.push_back(intent);
                    state.high_water = state.high_water.max(state.intents.len());
                    drop(state);
                    self.not_empty.notify_one();
                    return match evicted {
                        Some(evicted) => PushOutcome::DroppedOldest(evicted),
                        None => PushOutcome::Queued,
                    };
                }
            }
            debug!("Intent queue full, waiting for the publisher");
            self.not_full.notified().await;
        }
    }

    /// Next intent in FIFO order; `None` once closed and drained.
    pub async fn pop(&self) -> Option<PublishIntent> {
        loop {
            {
                let mut state = self.lock();
                if let Some(intent) = state.intents.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(intent);
                }
                if state.closed {
                    return None;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Rejects further pushes and wakes everyone waiting.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
        self.not_full.notify_waiters();
        self.not_full.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Intents evicted by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }
}
