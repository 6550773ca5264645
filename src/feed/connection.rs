//! One TCP session with the feed server.
//!
//! A [`FeedConnection`] writes the client root open tag as soon as the socket is
//! up and from then on turns received bytes into [`FeedEvent`]s through its own
//! [`StreamingElementParser`]. It knows nothing about MQTT; whoever owns it
//! decides what to do with the events and with the error that ends it.

use super::config::FeedConfig;
use super::error::FeedError;
use super::parser::{ElementEvent, StreamingElementParser};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// An element framed from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    RootOpen(Vec<u8>),
    Child(Vec<u8>),
}

#[derive(Debug)]
pub struct FeedConnection {
    stream: TcpStream,
    address: String,
    parser: StreamingElementParser,
    pending: VecDeque<ElementEvent>,
    read_buf: Vec<u8>,
    opened_at: DateTime<Local>,
    bytes_received: u64,
}

impl FeedConnection {
    /// Connects to the feed server and sends `client_root`.
    pub async fn open(config: &FeedConfig, client_root: &[u8]) -> Result<Self, FeedError> {
        let address = config.address.clone();
        let connect = TcpStream::connect(&address);
        let stream = match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(FeedError::Connect { address, source }),
            Err(_) => return Err(FeedError::ConnectTimeout(address)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not set TCP_NODELAY on feed socket: {}", e);
        }
        info!("Connected to feed server {}", address);

        let mut connection = Self {
            stream,
            address,
            parser: StreamingElementParser::new(config.max_element_size),
            pending: VecDeque::new(),
            read_buf: vec![0; config.read_buffer_size],
            opened_at: Local::now(),
            bytes_received: 0,
        };
        connection.send(client_root).await?;
        Ok(connection)
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), FeedError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        debug!("Sent {} bytes to {}", bytes.len(), self.address);
        Ok(())
    }

    /// Next framed element in parse order.
    ///
    /// Cancel safe: events already parsed stay queued if the future is dropped.
    pub async fn next_event(&mut self) -> Result<FeedEvent, FeedError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return match event {
                    ElementEvent::RootOpen(tag) => Ok(FeedEvent::RootOpen(tag)),
                    ElementEvent::Child(element) => Ok(FeedEvent::Child(element)),
                    ElementEvent::ProtocolError(e) => Err(FeedError::Protocol(e)),
                };
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(FeedError::PeerClosed);
            }
            self.bytes_received += n as u64;
            self.pending.extend(self.parser.feed(&self.read_buf[..n]));
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}
