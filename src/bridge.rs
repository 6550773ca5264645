//! Glue between the feed session and the broker link.
//!
//! The feed task turns each framed element into one [`PublishIntent`] and
//! pushes it onto the bounded [`IntentQueue`]; a separate publish task drains
//! the queue in order. Neither side waits on the other except through the
//! queue's overflow policy.

use crate::feed::{ElementSink, FeedEvent, SessionController, SessionStats};
use crate::mqtt::config::{MqttConfig, QueueConfig, RetryConfig};
use crate::mqtt::message_manager::{IntentQueue, PublishIntent, PushOutcome};
use crate::mqtt::mqtt_handler::{PublishStats, PublishWorker, Publisher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maps feed elements to publishes: the root tag is retained on the root
/// topic, children are plain publishes on the child topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPolicy {
    root_topic: String,
    child_topic: String,
}

impl PublishPolicy {
    pub fn new(root_topic: impl Into<String>, child_topic: Option<String>) -> Self {
        let root_topic = root_topic.into();
        let child_topic = child_topic.unwrap_or_else(|| root_topic.clone());
        Self {
            root_topic,
            child_topic,
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(config.topic.clone(), config.child_topic.clone())
    }

    pub fn intent_for(&self, event: FeedEvent) -> PublishIntent {
        match event {
            FeedEvent::RootOpen(tag) => PublishIntent::new(self.root_topic.clone(), tag, true),
            FeedEvent::Child(element) => {
                PublishIntent::new(self.child_topic.clone(), element, false)
            }
        }
    }
}

/// Feed-side end of the intent queue.
pub struct IntentSink {
    policy: PublishPolicy,
    queue: Arc<IntentQueue>,
    cancel: CancellationToken,
}

impl IntentSink {
    pub fn new(policy: PublishPolicy, queue: Arc<IntentQueue>, cancel: CancellationToken) -> Self {
        Self {
            policy,
            queue,
            cancel,
        }
    }
}

impl ElementSink for IntentSink {
    async fn deliver(&mut self, event: FeedEvent) {
        let intent = self.policy.intent_for(event);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            outcome = self.queue.push(intent) => outcome,
        };
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest(evicted) => {
                let dropped = self.queue.dropped();
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        "Intent queue full ({} entries), {} dropped so far, latest: {}",
                        self.queue.capacity(),
                        dropped,
                        evicted
                    );
                }
            }
            PushOutcome::Closed => debug!("Intent queue closed, element discarded"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub session: SessionStats,
    pub publish: PublishStats,
    pub queue_dropped: u64,
    pub queue_high_water: usize,
}

/// Runs one feed session against one publisher until cancelled.
pub struct BridgeOrchestrator<P> {
    controller: SessionController,
    publisher: P,
    policy: PublishPolicy,
    queue: Arc<IntentQueue>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl<P> BridgeOrchestrator<P>
where
    P: Publisher + Send + 'static,
{
    pub fn new(
        controller: SessionController,
        publisher: P,
        policy: PublishPolicy,
        queue: &QueueConfig,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            publisher,
            policy,
            queue: Arc::new(IntentQueue::new(queue)),
            retry,
            cancel,
        }
    }

    pub fn queue(&self) -> Arc<IntentQueue> {
        self.queue.clone()
    }

    pub async fn run(self) -> BridgeReport {
        let worker = PublishWorker::new(
            self.publisher,
            self.queue.clone(),
            self.retry,
            self.cancel.clone(),
        );
        let worker_handle = tokio::spawn(worker.run());

        let mut sink = IntentSink::new(self.policy, self.queue.clone(), self.cancel.clone());
        let session = self.controller.run(&mut sink).await;

        self.queue.close();
        let publish = match worker_handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Publish worker failed: {}", e);
                PublishStats::default()
            }
        };

        let report = BridgeReport {
            session,
            publish,
            queue_dropped: self.queue.dropped(),
            queue_high_water: self.queue.high_water(),
        };
        info!(
            "Bridge stopped: {} intents dropped by the queue, high water {}/{}",
            report.queue_dropped,
            report.queue_high_water,
            self.queue.capacity()
        );
        report
    }
}
