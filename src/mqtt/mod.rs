//! # MQTT Side
//!
//! The broker link and everything queued in front of it. The link has its own
//! reconnect loop and never feeds failures back to the feed session; an outage
//! only shows up as queued, retried or dropped intents.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - [mqtt] settings, queue and retry tunables
//! ├── message_manager.rs  - PublishIntent and the bounded intent queue
//! └── mqtt_handler.rs     - rumqttc event loop, Publisher trait, publish worker
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use message_manager::{IntentQueue, PublishIntent};
pub use mqtt_handler::{
    MqttHandler, MqttPublisher, PublishError, PublishStats, PublishWorker, Publisher,
};
