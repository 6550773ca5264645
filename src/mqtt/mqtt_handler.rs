use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, RetryConfig};
use super::message_manager::{IntentQueue, PublishIntent};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker not connected")]
    NotConnected,

    #[error("publish did not complete within {0:?}")]
    Timeout(Duration),

    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("broker link closed")]
    Closed,
}

/// Anything that can take a [`PublishIntent`] to a broker.
pub trait Publisher {
    fn publish(
        &mut self,
        intent: &PublishIntent,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub connects: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Owns the broker link: polls the rumqttc event loop and reconnects with
/// backoff when it fails. Connection state is published on a watch channel.
pub struct MqttHandler {
    eventloop: EventLoop,
    client: AsyncClient,
    config: MqttConfig,
    status: watch::Sender<MQTTStatus>,
}

impl MqttHandler {
    pub fn new(config: &MqttConfig) -> (Self, MqttPublisher) {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqtt_options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true);
        if let (Some(user), Some(pw)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(user.clone(), pw.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (status_tx, status_rx) = watch::channel(MQTTStatus::default());

        let publisher = MqttPublisher {
            client: client.clone(),
            status: status_rx,
            qos: config.qos(),
            timeout: config.publish_timeout(),
        };
        let handler = MqttHandler {
            eventloop,
            client,
            config: config.clone(),
            status: status_tx,
        };
        (handler, publisher)
    }

    fn update(&self, f: impl FnOnce(&mut MQTTStatus)) {
        self.status.send_modify(f);
    }

    /// Drives the broker link until `cancel` fires, then disconnects cleanly.
    pub async fn run(mut self, cancel: CancellationToken) -> MQTTStatus {
        info!("Connecting to MQTT broker {}:{}", self.config.host, self.config.port);
        self.update(|s| s.connection_state = ConnectionState::Connecting);
        let mut failures: u32 = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("MQTT broker connected (session present: {})", ack.session_present);
                    failures = 0;
                    self.update(|s| {
                        s.connection_state = ConnectionState::Connected;
                        s.connects += 1;
                        s.last_activity = Some(chrono::Local::now());
                    });
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    debug!("Publish sent (pkid {})", pkid);
                    self.update(|s| {
                        s.messages_sent += 1;
                        s.last_activity = Some(chrono::Local::now());
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.reconnect.delay(failures);
                    warn!(
                        "MQTT connection error: {}. Retrying in {:.1}s",
                        e,
                        delay.as_secs_f64()
                    );
                    self.update(|s| {
                        s.connection_state = ConnectionState::Reconnecting;
                        s.last_error = Some(e.to_string());
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> MQTTStatus {
        let connected = self.status.borrow().connection_state == ConnectionState::Connected;
        if connected && self.client.try_disconnect().is_ok() {
            // Flush the DISCONNECT packet, give up quickly if the broker is gone
            let flushed = tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if flushed.is_err() {
                debug!("MQTT disconnect not flushed in time");
            }
        }
        self.update(|s| s.connection_state = ConnectionState::Disconnected);
        info!("MQTT broker link closed");
        self.status.borrow().clone()
    }
}

/// Cloneable publish handle for the link owned by [`MqttHandler`].
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    status: watch::Receiver<MQTTStatus>,
    qos: QoS,
    timeout: Duration,
}

impl Publisher for MqttPublisher {
    async fn publish(&mut self, intent: &PublishIntent) -> Result<(), PublishError> {
        let connected = tokio::time::timeout(
            self.timeout,
            self.status
                .wait_for(|s| s.connection_state == ConnectionState::Connected),
        )
        .await
        .map(|ready| ready.map(|_| ()));
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(PublishError::Closed),
            Err(_) => return Err(PublishError::NotConnected),
        }

        tokio::time::timeout(
            self.timeout,
            self.client
                .publish(intent.topic.clone(), self.qos, intent.retained, intent.payload.clone()),
        )
        .await
        .map_err(|_| PublishError::Timeout(self.timeout))??;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub retained: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
}

/// Drains the intent queue in order, one publish at a time.
///
/// Children get `max_attempts` tries and are dropped afterwards. Retained root
/// tags are retried until they go through or shutdown.
pub struct PublishWorker<P: Publisher> {
    publisher: P,
    queue: Arc<IntentQueue>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl<P: Publisher> PublishWorker<P> {
    pub fn new(
        publisher: P,
        queue: Arc<IntentQueue>,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            publisher,
            queue,
            retry,
            cancel,
        }
    }

    pub async fn run(mut self) -> PublishStats {
        let mut stats = PublishStats::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                intent = self.queue.pop() => intent,
            };
            let Some(intent) = next else {
                break;
            };
            self.deliver(intent, &mut stats).await;
        }
        info!(
            "Publish worker stopped: {} published ({} retained), {} failed attempts, {} dropped",
            stats.published, stats.retained, stats.failed_attempts, stats.dropped
        );
        stats
    }

    async fn deliver(&mut self, intent: PublishIntent, stats: &mut PublishStats) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.publisher.publish(&intent) => result,
            };

            match result {
                Ok(()) => {
                    debug!("Published {}", intent);
                    stats.published += 1;
                    if intent.retained {
                        stats.retained += 1;
                    }
                    return;
                }
                Err(e) => {
                    stats.failed_attempts += 1;
                    if !intent.retained && attempt >= self.retry.max_attempts {
                        error!("Dropping {} after {} attempts: {}", intent, attempt, e);
                        stats.dropped += 1;
                        return;
                    }
                    warn!("Publish attempt {} failed: {}", attempt, e);
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry.delay()) => {}
            }
        }
    }
}
