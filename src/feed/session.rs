//! Feed session controller with a statum state machine
//!
//! Owns the one live [`FeedConnection`] and alone decides when to reconnect.
//! Every feed-side failure funnels into the same path: drop the connection and
//! its parser, wait out the backoff, connect again.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► AwaitingRootOpen ──► Streaming
//!      ▲  (backoff)     │                 │                 │
//!      └────────────────┴─────────────────┴─────────────────┘
//!            connect error, timeout, I/O error, protocol error, peer close
//! ```
//!
//! Transitions consume the session, so a connection can only be read from in
//! the states that hold one.

use super::config::FeedConfig;
use super::connection::{FeedConnection, FeedEvent};
use super::error::FeedError;
use super::messenger::Messenger;
use super::parser::{self, ParseError};
use chrono::Local;
use statum::{machine, state};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives framed elements in parse order.
pub trait ElementSink {
    fn deliver(&mut self, event: FeedEvent) -> impl Future<Output = ()> + Send;
}

impl ElementSink for mpsc::UnboundedSender<FeedEvent> {
    async fn deliver(&mut self, event: FeedEvent) {
        if self.send(event).is_err() {
            debug!("Element sink receiver dropped");
        }
    }
}

/// Counters for one session controller lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connect_attempts: u64,
    pub connections: u64,
    pub root_opens: u64,
    pub children: u64,
    pub failures: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connections, {} root tags, {} children, {} failures",
            self.connections, self.root_opens, self.children, self.failures
        )
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingRootOpen,
    Streaming,
}

#[machine]
pub struct FeedSession<S: SessionState> {
    config: FeedConfig,
    messenger: Messenger,
    connection: Option<FeedConnection>,
    // Consecutive failed connections since the last stable one
    retries: u32,
    // Last subscription request was acknowledged; resume next time
    subscribed: bool,
    stats: SessionStats,
}

/// A session that lost its connection, together with the reason.
pub struct Disconnect {
    pub session: FeedSession<Disconnected>,
    pub reason: FeedError,
}

impl<S: SessionState> FeedSession<S> {
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

// Disconnecting is the same from every connected state: the connection and
// its parser are dropped, nothing of a partial child survives.
macro_rules! impl_disconnect {
    ($($state:ty),+) => {$(
        impl FeedSession<$state> {
            fn disconnect(mut self, reason: FeedError) -> Disconnect {
                self.connection = None;
                if !matches!(reason, FeedError::Cancelled) {
                    self.retries = self.retries.saturating_add(1);
                    self.stats.failures += 1;
                }
                Disconnect {
                    session: self.transition(),
                    reason,
                }
            }
        }
    )+};
}

impl_disconnect!(Connecting, AwaitingRootOpen, Streaming);

impl FeedSession<Disconnected> {
    pub fn create(config: FeedConfig, messenger: Messenger) -> Self {
        debug!("Creating feed session for {}", config.address);
        Self::new(config, messenger, None, 0, false, SessionStats::default())
    }

    /// Waits out the backoff for the current retry count, then moves on to
    /// connecting. Hands the session back unchanged if shutdown is requested.
    pub async fn reconnect(
        self,
        cancel: &CancellationToken,
    ) -> Result<FeedSession<Connecting>, FeedSession<Disconnected>> {
        if cancel.is_cancelled() {
            return Err(self);
        }
        let delay = self.config.backoff.delay(self.retries);
        if !delay.is_zero() {
            info!(
                "Reconnecting to feed in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                self.retries
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(self.transition())
    }
}

impl FeedSession<Connecting> {
    pub async fn connect(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<FeedSession<AwaitingRootOpen>, Disconnect> {
        self.stats.connect_attempts += 1;
        let client_root = match self.messenger.client_root() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.disconnect(e.into())),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FeedError::Cancelled),
            result = FeedConnection::open(&self.config, &client_root) => result,
        };

        match opened {
            Ok(connection) => {
                self.stats.connections += 1;
                self.connection = Some(connection);
                debug!("Client root tag sent, awaiting server root tag");
                Ok(self.transition())
            }
            Err(e) => Err(self.disconnect(e)),
        }
    }
}

impl FeedSession<AwaitingRootOpen> {
    /// Waits for the server's root open tag within the grace period and hands
    /// it to `sink`.
    pub async fn await_root_open<K>(
        mut self,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<FeedSession<Streaming>, Disconnect>
    where
        K: ElementSink + Send,
    {
        let Some(mut connection) = self.connection.take() else {
            return Err(self.disconnect(FeedError::PeerClosed));
        };

        let grace = self.config.root_open_timeout();
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FeedError::Cancelled),
            result = tokio::time::timeout(grace, connection.next_event()) => match result {
                Ok(event) => event,
                Err(_) => Err(FeedError::RootOpenTimeout(grace)),
            },
        };

        match first {
            Ok(FeedEvent::RootOpen(tag)) => {
                info!(
                    "Feed root element received from {}: {}",
                    connection.address(),
                    String::from_utf8_lossy(&tag)
                );
                self.stats.root_opens += 1;
                sink.deliver(FeedEvent::RootOpen(tag)).await;
                self.connection = Some(connection);
                Ok(self.transition())
            }
            // The parser never frames a child before the root.
            Ok(FeedEvent::Child(_)) => Err(self.disconnect(FeedError::Protocol(
                ParseError::Malformed("element before the root element".to_string()),
            ))),
            Err(e) => Err(self.disconnect(e)),
        }
    }
}

impl FeedSession<Streaming> {
    /// Forwards children to `sink` until the connection fails.
    ///
    /// Always ends in [`Disconnect`]: an endless document has no graceful end.
    pub async fn stream<K>(mut self, sink: &mut K, cancel: &CancellationToken) -> Disconnect
    where
        K: ElementSink + Send,
    {
        let Some(mut connection) = self.connection.take() else {
            return self.disconnect(FeedError::PeerClosed);
        };

        if let Err(e) = self.request_subscription(&mut connection).await {
            return self.disconnect(e);
        }

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FeedError::Cancelled),
                result = connection.next_event() => result,
            };

            match next {
                Ok(FeedEvent::Child(element)) => {
                    self.stats.children += 1;
                    let reply = self.handle_dialogue(&element);
                    sink.deliver(FeedEvent::Child(element)).await;
                    match reply {
                        Ok(Some(bytes)) => {
                            if let Err(e) = connection.send(&bytes).await {
                                break e;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break e,
                    }
                }
                // The parser reports a second root as a protocol error.
                Ok(FeedEvent::RootOpen(tag)) => {
                    break FeedError::Protocol(ParseError::SecondRoot(
                        String::from_utf8_lossy(&tag).into_owned(),
                    ))
                }
                Err(e) => break e,
            }
        };

        let age = Local::now() - connection.opened_at();
        let stable = age
            .to_std()
            .is_ok_and(|age| age >= self.config.stable_after());
        if stable {
            self.retries = 0;
        }
        info!(
            "Feed connection to {} ended after {}s, {} bytes received (session so far: {})",
            connection.address(),
            age.num_seconds(),
            connection.bytes_received(),
            self.stats
        );
        drop(connection);
        self.disconnect(reason)
    }

    async fn request_subscription(
        &mut self,
        connection: &mut FeedConnection,
    ) -> Result<(), FeedError> {
        let resume = self.subscribed;
        if let Some(request) = self.messenger.subscription_request(resume)? {
            info!(
                "Requesting {} subscription",
                if resume { "resumed" } else { "new" }
            );
            connection.send(&request).await?;
        }
        Ok(())
    }

    /// Reacts to subscription control messages; every child is still forwarded.
    fn handle_dialogue(&mut self, element: &[u8]) -> Result<Option<Vec<u8>>, FeedError> {
        let Some(name) = parser::element_name(element) else {
            return Ok(None);
        };

        match parser::local_name(name) {
            b"SubscriptionResponse" => {
                info!("Subscription accepted by feed server");
                self.subscribed = true;
                Ok(None)
            }
            b"SubscriptionResumeResponse" => {
                info!("Subscription resumed by feed server");
                Ok(None)
            }
            // "Resume point too old, recovering from the earliest possible time"
            b"SubscriptionErrorReport"
                if parser::attribute(element, "Code").as_deref() == Some("122") =>
            {
                warn!("Feed server: {}", String::from_utf8_lossy(element));
                Ok(None)
            }
            b"SubscriptionErrorReport" | b"SubscriptionErrorResponse" => {
                error!("Feed server: {}", String::from_utf8_lossy(element));
                self.subscribed = false;
                Err(FeedError::Subscription(
                    String::from_utf8_lossy(element).into_owned(),
                ))
            }
            b"LastProcessedMessageRequest" => {
                let Some(message_id) = parser::attribute(element, "MessageId") else {
                    warn!("LastProcessedMessageRequest without MessageId");
                    return Ok(None);
                };
                debug!("Last processed message requested for {}", message_id);
                Ok(self.messenger.last_processed(&message_id)?)
            }
            _ => Ok(None),
        }
    }
}

/// Drives a [`FeedSession`] through connect/stream/backoff cycles until
/// cancelled.
pub struct SessionController {
    config: FeedConfig,
    messenger: Messenger,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(config: FeedConfig, messenger: Messenger, cancel: CancellationToken) -> Self {
        Self {
            config,
            messenger,
            cancel,
        }
    }

    pub async fn run<K>(self, sink: &mut K) -> SessionStats
    where
        K: ElementSink + Send,
    {
        info!(
            "Starting feed session for {} ({})",
            self.config.address,
            if self.messenger.has_subscription_dialogue() {
                "client root and subscription request"
            } else {
                "client root only"
            }
        );
        let mut session = FeedSession::create(self.config, self.messenger);

        loop {
            let connecting = match session.reconnect(&self.cancel).await {
                Ok(connecting) => connecting,
                Err(idle) => {
                    session = idle;
                    break;
                }
            };

            let Disconnect {
                session: disconnected,
                reason,
            } = match connecting.connect(&self.cancel).await {
                Ok(awaiting) => match awaiting.await_root_open(sink, &self.cancel).await {
                    Ok(streaming) => streaming.stream(sink, &self.cancel).await,
                    Err(disconnect) => disconnect,
                },
                Err(disconnect) => disconnect,
            };
            session = disconnected;

            if matches!(reason, FeedError::Cancelled) {
                break;
            }
            warn!("Feed connection lost: {}", reason);
        }

        let stats = session.stats().clone();
        info!("Feed session stopped: {}", stats);
        stats
    }
}
