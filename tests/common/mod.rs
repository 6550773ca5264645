#![allow(dead_code)]

use roiorbison::backoff::BackoffConfig;
use roiorbison::bridge::{BridgeOrchestrator, PublishPolicy};
use roiorbison::feed::config::FeedConfig;
use roiorbison::feed::messenger::{Messenger, Template};
use roiorbison::feed::SessionController;
use roiorbison::mqtt::config::{QueueConfig, RetryConfig};
use roiorbison::mqtt::{PublishError, PublishIntent, Publisher};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "roi/test";
pub const CLIENT_ROOT: &str = "<Client>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Online,
    /// Every publish fails right away
    Failing,
    /// Publishes hang until the broker comes back
    Stalled,
}

struct BrokerState {
    mode: BrokerMode,
    log: Vec<PublishIntent>,
    retained: HashMap<String, Vec<u8>>,
}

/// In-memory broker that records publishes and keeps retained payloads per
/// topic the way a real broker does.
#[derive(Clone)]
pub struct RecordingBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl RecordingBroker {
    pub fn new(mode: BrokerMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                mode,
                log: Vec::new(),
                retained: HashMap::new(),
            })),
        }
    }

    pub fn set_mode(&self, mode: BrokerMode) {
        self.state.lock().unwrap().mode = mode;
    }

    pub fn log(&self) -> Vec<PublishIntent> {
        self.state.lock().unwrap().log.clone()
    }

    /// `(payload, retained)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, bool)> {
        self.log()
            .into_iter()
            .map(|intent| (String::from_utf8(intent.payload).unwrap(), intent.retained))
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .retained
            .get(topic)
            .map(|payload| String::from_utf8(payload.clone()).unwrap())
    }
}

impl Publisher for RecordingBroker {
    async fn publish(&mut self, intent: &PublishIntent) -> Result<(), PublishError> {
        loop {
            let mode = self.state.lock().unwrap().mode;
            match mode {
                BrokerMode::Online => {
                    let mut state = self.state.lock().unwrap();
                    if intent.retained {
                        state.retained.insert(intent.topic.clone(), intent.payload.clone());
                    }
                    state.log.push(intent.clone());
                    return Ok(());
                }
                BrokerMode::Failing => return Err(PublishError::NotConnected),
                BrokerMode::Stalled => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }
}

pub fn root(payload: &str) -> (String, bool) {
    (payload.to_string(), true)
}

pub fn child(payload: &str) -> (String, bool) {
    (payload.to_string(), false)
}

pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

/// Accepts the next connection and consumes the client root tag.
pub async fn accept_client(listener: &TcpListener) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    read_until(&mut socket, CLIENT_ROOT).await;
    socket
}

/// Reads until `needle` has been received and returns everything read.
pub async fn read_until(socket: &mut TcpStream, needle: &str) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !String::from_utf8_lossy(&received).contains(needle) {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed while waiting for {needle}");
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle}"));
    String::from_utf8(received).unwrap()
}

pub async fn send(socket: &mut TcpStream, bytes: &str) {
    socket.write_all(bytes.as_bytes()).await.unwrap();
    socket.flush().await.unwrap();
}

/// Keeps a feed connection open until the test ends.
pub async fn hold(socket: TcpStream) {
    tokio::time::sleep(Duration::from_secs(30)).await;
    drop(socket);
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

pub fn feed_config(address: &str) -> FeedConfig {
    let mut config = FeedConfig::new(address);
    config.backoff = BackoffConfig {
        initial_ms: 10,
        max_ms: 50,
        multiplier: 2.0,
    };
    config.root_open_timeout_ms = 2_000;
    config.connect_timeout_ms = 1_000;
    config
}

pub fn messenger() -> Messenger {
    Messenger::new(Template::parse(CLIENT_ROOT).unwrap(), BTreeMap::new())
}

pub fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        delay_ms: 5,
    }
}

pub fn bridge(
    feed: FeedConfig,
    messenger: Messenger,
    broker: &RecordingBroker,
    queue: QueueConfig,
    retry: RetryConfig,
) -> (BridgeOrchestrator<RecordingBroker>, CancellationToken) {
    let cancel = CancellationToken::new();
    let controller = SessionController::new(feed, messenger, cancel.clone());
    let orchestrator = BridgeOrchestrator::new(
        controller,
        broker.clone(),
        PublishPolicy::new(TOPIC, None),
        &queue,
        retry,
        cancel.clone(),
    );
    (orchestrator, cancel)
}
