use crate::backoff::BackoffConfig;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection and publish settings (`[mqtt]`).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Topic for the retained root tag, and for children unless `child_topic` is set
    pub topic: String,

    pub child_topic: Option<String>,

    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default)]
    pub reconnect: BackoffConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "roiorbison".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

impl MqttConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            topic: topic.into(),
            child_topic: None,
            qos: default_qos(),
            keep_alive_secs: default_keep_alive_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            reconnect: BackoffConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("mqtt.host must not be empty".to_string());
        }
        if self.topic.is_empty() || self.topic.contains(['+', '#']) {
            return Err(format!("mqtt.topic {:?} is not a valid publish topic", self.topic));
        }
        if let Some(child) = &self.child_topic {
            if child.is_empty() || child.contains(['+', '#']) {
                return Err(format!("mqtt.child_topic {:?} is not a valid publish topic", child));
            }
        }
        if self.qos > 2 {
            return Err(format!("mqtt.qos must be 0, 1 or 2, got {}", self.qos));
        }
        // rumqttc rejects keep alive intervals below five seconds
        if self.keep_alive_secs < 5 {
            return Err("mqtt.keep_alive_secs must be at least 5".to_string());
        }
        if self.username.is_some() != self.password.is_some() {
            return Err("mqtt.username and mqtt.password must be set together".to_string());
        }
        if self.publish_timeout_ms == 0 {
            return Err("mqtt.publish_timeout_ms must be greater than zero".to_string());
        }
        if self.queue.capacity == 0 {
            return Err("mqtt.queue.capacity must be greater than zero".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("mqtt.retry.max_attempts must be at least 1".to_string());
        }
        self.reconnect.validate("mqtt.reconnect")
    }
}

/// What happens when the intent queue is full.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued child; the feed keeps flowing
    #[default]
    DropOldest,
    /// Pause the feed until the publisher catches up
    Block,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
