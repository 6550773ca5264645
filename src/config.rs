//! Configuration file loading.
//!
//! One TOML file with `[feed]`, `[templates]`, `[mqtt]` and `[logging]`
//! sections. Everything is validated once at startup, templates included, so a
//! bad file never reaches the state machines.

use crate::feed::config::{FeedConfig, TemplateSource, TemplatesConfig};
use crate::feed::messenger::{Messenger, Template, TemplateError};
use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, Level};

pub const APP_DIR: &str = "roiorbison";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("no configuration directory found, pass --config")]
    NoConfigDir,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub feed: FeedConfig,
    pub templates: TemplatesConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown logging.level {:?}", self.level)))
    }
}

/// `<config_dir>/roiorbison/config.toml`
pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

impl Config {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed.validate().map_err(ConfigError::Invalid)?;
        self.mqtt.validate().map_err(ConfigError::Invalid)?;
        self.logging.level()?;
        Ok(())
    }

    /// Reads and checks every template. `base` is the directory relative
    /// template files are resolved against.
    pub async fn messenger(&self, base: &Path) -> Result<Messenger, ConfigError> {
        self.templates.messenger(base).await
    }
}

impl TemplatesConfig {
    pub async fn messenger(&self, base: &Path) -> Result<Messenger, ConfigError> {
        let mut messenger = Messenger::new(
            load_template("client_root", &self.client_root, base).await?,
            self.mapping.clone(),
        );
        if let Some(source) = &self.subscribe {
            messenger = messenger.with_subscribe(load_template("subscribe", source, base).await?);
        }
        if let Some(source) = &self.resume_subscription {
            let template = load_template("resume_subscription", source, base).await?;
            messenger = messenger.with_resume_subscription(template);
        }
        if let Some(source) = &self.last_processed {
            let template = load_template("last_processed", source, base).await?;
            messenger = messenger.with_last_processed(template);
        }
        if self.resume_subscription.is_some() && self.subscribe.is_none() {
            return Err(ConfigError::Invalid(
                "templates.resume_subscription requires templates.subscribe".to_string(),
            ));
        }

        messenger.check().map_err(|(name, source)| ConfigError::Template {
            name: name.to_string(),
            source,
        })?;
        Ok(messenger)
    }
}

async fn load_template(
    name: &str,
    source: &TemplateSource,
    base: &Path,
) -> Result<Template, ConfigError> {
    let text = match source {
        TemplateSource::Text(text) => text.clone(),
        TemplateSource::File(file) => {
            let path = base.join(file);
            debug!("Reading template {} from {}", name, path.display());
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ConfigError::Io { path, source })?
        }
    };
    Template::parse(&text).map_err(|source| ConfigError::Template {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::OverflowPolicy;
    use std::io::Write;

    const FULL: &str = r#"
[feed]
address = "127.0.0.1:7001"
root_open_timeout_ms = 5000

[feed.backoff]
initial_ms = 500
max_ms = 30000
multiplier = 1.5

[templates]
subscribe = { file = "subscribe.xml" }

[templates.client_root]
text = '<ServiceDelivery xmlns="urn:roi" MessageId="${message_id}" ClientId="${client}">'

[templates.mapping]
client = "roiorbison"

[mqtt]
host = "broker.local"
topic = "roi/feed"
child_topic = "roi/feed/messages"
qos = 0

[mqtt.queue]
capacity = 50
overflow = "block"

[logging]
level = "debug"
"#;

    #[tokio::test]
    async fn loads_a_complete_file_with_template_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, FULL).unwrap();
        let mut template = std::fs::File::create(dir.path().join("subscribe.xml")).unwrap();
        write!(template, "<SubscriptionRequest MessageId=\"${{message_id}}\"/>").unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.feed.address, "127.0.0.1:7001");
        assert_eq!(config.feed.backoff.initial_ms, 500);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.queue.overflow, OverflowPolicy::Block);
        assert_eq!(config.logging.level().unwrap(), Level::DEBUG);

        let mut messenger = config.messenger(dir.path()).await.unwrap();
        assert!(messenger.has_subscription_dialogue());
        assert_eq!(
            messenger.client_root().unwrap(),
            b"<ServiceDelivery xmlns=\"urn:roi\" MessageId=\"0\" ClientId=\"roiorbison\">".to_vec()
        );
        assert_eq!(
            messenger.subscription_request(false).unwrap(),
            Some(b"<SubscriptionRequest MessageId=\"1\"/>".to_vec())
        );
    }

    #[test]
    fn example_file_is_valid() {
        let text = include_str!("../config.example.toml");
        let config = Config::parse(text, Path::new("config.example.toml")).unwrap();
        assert_eq!(config.mqtt.reconnect.max_ms, 30_000);
        assert_eq!(config.mqtt.reconnect.multiplier, 2.0);
        assert!(config.templates.last_processed.is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = FULL.replace("qos = 0", "qos = 0\nretain_children = true");
        assert!(matches!(
            Config::parse(&text, Path::new("x.toml")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let text = FULL.replace("qos = 0", "qos = 5");
        assert!(matches!(
            Config::parse(&text, Path::new("x.toml")),
            Err(ConfigError::Invalid(_))
        ));

        let text = FULL.replace("level = \"debug\"", "level = \"chatty\"");
        assert!(matches!(
            Config::parse(&text, Path::new("x.toml")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn missing_template_values_fail_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL.replace("client = \"roiorbison\"", "");
        let config = Config::parse(&text, Path::new("x.toml")).unwrap();
        std::fs::write(dir.path().join("subscribe.xml"), "<S/>").unwrap();
        match config.messenger(dir.path()).await {
            Err(ConfigError::Template { name, source }) => {
                assert_eq!(name, "client_root");
                assert_eq!(source, TemplateError::MissingValue("client".to_string()));
            }
            other => panic!("expected a template error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn missing_template_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::parse(FULL, Path::new("x.toml")).unwrap();
        assert!(matches!(
            config.messenger(dir.path()).await,
            Err(ConfigError::Io { .. })
        ));
    }
}
