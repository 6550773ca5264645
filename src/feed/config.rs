use crate::backoff::BackoffConfig;
use crate::feed::parser::DEFAULT_MAX_ELEMENT_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Feed server connection settings (`[feed]`).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    /// `host:port` of the feed server
    pub address: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Grace period for the server's root open tag after connecting
    #[serde(default = "default_root_open_timeout_ms")]
    pub root_open_timeout_ms: u64,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Largest single element buffered before the connection is dropped
    #[serde(default = "default_max_element_size")]
    pub max_element_size: usize,

    /// A streaming connection that lived this long resets the backoff
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_root_open_timeout_ms() -> u64 {
    30_000
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_element_size() -> usize {
    DEFAULT_MAX_ELEMENT_SIZE
}

fn default_stable_after_ms() -> u64 {
    60_000
}

impl FeedConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            root_open_timeout_ms: default_root_open_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            max_element_size: default_max_element_size(),
            stable_after_ms: default_stable_after_ms(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn root_open_timeout(&self) -> Duration {
        Duration::from_millis(self.root_open_timeout_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.address.trim().is_empty() {
            return Err("feed.address must not be empty".to_string());
        }
        if !self.address.contains(':') {
            return Err(format!("feed.address {:?} must be host:port", self.address));
        }
        if self.connect_timeout_ms == 0 || self.root_open_timeout_ms == 0 {
            return Err("feed timeouts must be greater than zero".to_string());
        }
        if self.read_buffer_size == 0 || self.max_element_size == 0 {
            return Err("feed buffer sizes must be greater than zero".to_string());
        }
        self.backoff.validate("feed.backoff")
    }
}

/// Where a template's text comes from.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    Text(String),
    /// Relative paths resolve against the configuration file's directory
    File(PathBuf),
}

/// Client message templates (`[templates]`).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TemplatesConfig {
    pub client_root: TemplateSource,
    pub subscribe: Option<TemplateSource>,
    pub resume_subscription: Option<TemplateSource>,
    pub last_processed: Option<TemplateSource>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}
