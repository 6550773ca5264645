//! # roiorbison
//!
//! Bridges an endless ROI XML feed over TCP to an MQTT topic. The server's root
//! open tag is published retained, every child element as a plain message, so
//! a subscriber joining at any time can rebuild a consistent XML view.
//!
//! ```text
//! feed server ──TCP──► feed::session ──► bridge ──► IntentQueue ──► mqtt ──► broker
//! ```

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod feed;
pub mod mqtt;
