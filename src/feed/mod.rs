//! # Feed Side
//!
//! Everything between the feed server's TCP socket and framed XML elements.
//!
//! ```text
//! feed/
//! ├── parser.rs      - Incremental element framing over an endless document
//! ├── connection.rs  - One TCP session: client root out, element events in
//! ├── messenger.rs   - Client message templates
//! ├── session.rs     - Connect/stream/backoff state machine
//! ├── config.rs      - [feed] and [templates] settings
//! └── error.rs       - Reasons a connection ends
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod messenger;
pub mod parser;
pub mod session;

pub use connection::FeedEvent;
pub use error::FeedError;
pub use session::{ElementSink, SessionController, SessionStats};
