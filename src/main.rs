use clap::Parser;
use color_eyre::Result;
use roiorbison::bridge::{BridgeOrchestrator, PublishPolicy};
use roiorbison::config::{self, Config};
use roiorbison::feed::SessionController;
use roiorbison::mqtt::MqttHandler;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Republishes an ROI XML feed on an MQTT topic.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file, defaults to <config dir>/roiorbison/config.toml
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let config = Config::load(&path).await?;
    setup_logging(config.logging.level()?);

    let base = path.parent().unwrap_or(Path::new("."));
    let messenger = config.messenger(base).await?;
    info!(
        "Bridging feed {} to mqtt://{}:{}/{}",
        config.feed.address, config.mqtt.host, config.mqtt.port, config.mqtt.topic
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });

    let (mqtt_handler, publisher) = MqttHandler::new(&config.mqtt);
    let mqtt_handle = tokio::spawn(mqtt_handler.run(cancel.clone()));

    let controller = SessionController::new(config.feed.clone(), messenger, cancel.clone());
    let bridge = BridgeOrchestrator::new(
        controller,
        publisher,
        PublishPolicy::from_config(&config.mqtt),
        &config.mqtt.queue,
        config.mqtt.retry.clone(),
        cancel.clone(),
    );
    let report = bridge.run().await;
    cancel.cancel();

    match mqtt_handle.await {
        Ok(status) => {
            info!(
                "Broker link: {} connects, {} publishes sent",
                status.connects, status.messages_sent
            );
            if let Some(e) = status.last_error {
                warn!("Last broker error: {}", e);
            }
        }
        Err(e) => error!("MQTT task failed: {}", e),
    }
    info!(
        "Stopped after {} feed connections, {} elements forwarded, {} published, {} dropped",
        report.session.connections,
        report.session.root_opens + report.session.children,
        report.publish.published,
        report.publish.dropped + report.queue_dropped
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
