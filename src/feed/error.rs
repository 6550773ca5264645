use super::messenger::TemplateError;
use super::parser::ParseError;
use std::time::Duration;
use thiserror::Error;

/// Everything that can end a feed connection.
///
/// None of these are fatal to the process; the session controller answers each
/// one with a backoff and a fresh connection, except [`FeedError::Cancelled`]
/// which ends the session loop.
#[derive(Debug, Error)]
pub enum FeedError {
    /// TCP connect was refused or failed.
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    /// Reading from or writing to an established connection failed.
    #[error("feed I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("feed protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("feed server closed the connection")]
    PeerClosed,

    /// The server never sent its root open tag within the grace period.
    #[error("no root element received within {0:?}")]
    RootOpenTimeout(Duration),

    #[error("subscription rejected by the feed server: {0}")]
    Subscription(String),

    #[error("could not render client message: {0}")]
    Template(#[from] TemplateError),

    #[error("shutdown requested")]
    Cancelled,
}
