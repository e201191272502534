//! instrument-pubsub - Main Entry Point
//!
//! Publishes instrument messages to an MQTT broker and optionally waits for
//! them to come back on a subscription.

use clap::Parser;
use instrument_pubsub::config::{ConfigOverrides, PubSubConfig, PublishFailurePolicy};
use instrument_pubsub::observability::init_default_logging;
use instrument_pubsub::runner::{PubSubRunner, ShutdownHandle};
use instrument_pubsub::transport::mqtt::MqttClient;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

/// Publish instrument messages to an MQTT broker and verify they round-trip
#[derive(Parser, Debug)]
#[command(name = "instrument-pubsub")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker host name or mqtt:// / mqtts:// URL
    #[arg(long, env = "PUBSUB_ENDPOINT")]
    endpoint: Option<String>,

    /// Broker port (8883 for TLS, 1883 otherwise)
    #[arg(long)]
    port: Option<u16>,

    /// Client certificate file (PEM)
    #[arg(long, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// Client private key file (PEM)
    #[arg(long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Root CA file (PEM)
    #[arg(long = "ca-file", value_name = "FILE")]
    ca_file: Option<PathBuf>,

    /// HTTP proxy host to connect through
    #[arg(long = "proxy-host")]
    proxy_host: Option<String>,

    /// HTTP proxy port
    #[arg(long = "proxy-port")]
    proxy_port: Option<u16>,

    /// Client id; defaults to test-<uuid>
    #[arg(long = "client-id", env = "PUBSUB_CLIENT_ID")]
    client_id: Option<String>,

    /// Topic to publish to
    #[arg(long)]
    topic: Option<String>,

    /// Number of messages to publish; 0 publishes until interrupted
    #[arg(long)]
    count: Option<u64>,

    /// Operator name placed in each message
    #[arg(long = "id")]
    operator: Option<String>,

    /// Instrument temperature placed in each message
    #[arg(long = "temp")]
    temperature: Option<String>,

    /// CI mode: keep the endpoint and client id out of the logs
    #[arg(long = "is-ci")]
    is_ci: bool,

    /// Message text
    #[arg(long)]
    message: Option<String>,

    /// Subscribe to the topic and wait for the published messages
    #[arg(long)]
    subscribe: bool,

    /// Delay between messages in milliseconds
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Give up waiting for messages after this many seconds
    #[arg(long = "receive-timeout-secs")]
    receive_timeout_secs: Option<u64>,

    /// What to do when a publish fails
    #[arg(long = "on-publish-error", value_enum)]
    on_publish_error: Option<PublishFailurePolicy>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            endpoint: self.endpoint.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            cert_path: self.cert.clone(),
            key_path: self.key.clone(),
            ca_path: self.ca_file.clone(),
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
            topic: self.topic.clone(),
            count: self.count,
            interval_ms: self.interval_ms,
            subscribe: self.subscribe,
            receive_timeout_secs: self.receive_timeout_secs,
            on_publish_error: self.on_publish_error,
            ci_mode: self.is_ci,
            message: self.message.clone(),
            operator: self.operator.clone(),
            temperature: self.temperature.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting instrument-pubsub v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("Run failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<PubSubConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            PubSubConfig::load_from_file(path)?
        }
        None => PubSubConfig::default(),
    };
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

async fn run(config: PubSubConfig) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MqttClient::new(config.mqtt.clone())?;
    let mut runner = PubSubRunner::new(config, transport);

    let signals = tokio::spawn(forward_shutdown_signals(runner.shutdown_handle()));
    let result = runner.run().await;
    signals.abort();

    let summary = result?;
    if summary.cancelled {
        info!(
            published = summary.published,
            received = summary.received,
            "Run cancelled"
        );
    }
    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some publishes failed");
    }
    Ok(())
}

/// Turn SIGINT/SIGTERM into a graceful stop of the run
async fn forward_shutdown_signals(handle: ShutdownHandle) {
    let (mut sigint, mut sigterm) = match (
        signal::unix::signal(signal::unix::SignalKind::interrupt()),
        signal::unix::signal(signal::unix::SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Signal handlers unavailable");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
    handle.trigger();
}
