//! Configuration for the publish/subscribe run
//!
//! Settings come from an optional TOML file and are then overridden by
//! command line flags. Validation happens once, after overrides are applied.

use crate::protocol::{
    local_hostname, validate_client_id, validate_topic_name, MessageTemplate, PayloadShape,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PubSubConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub message: MessageSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker host name, or a `mqtt://` / `mqtts://` URL
    pub endpoint: String,
    /// Port override; AWS IoT accepts 443 and 8883
    pub port: Option<u16>,
    /// Client identifier, unique per concurrent connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Client certificate in PEM format
    pub cert_path: Option<PathBuf>,
    /// Client private key in PEM format
    pub key_path: Option<PathBuf>,
    /// Root CA bundle in PEM format
    pub ca_path: Option<PathBuf>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Ask the broker to discard any stored session on connect
    #[serde(default)]
    pub clean_start: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// HTTP proxy to tunnel the broker connection through
    pub proxy_host: Option<String>,
    /// Defaults to 8080 when only a proxy host is given
    pub proxy_port: Option<u16>,
}

/// What to publish and whether to listen for it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Number of messages to send; 0 publishes until shutdown
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Subscribe to `topic` and wait for the published messages to come back
    #[serde(default)]
    pub subscribe: bool,
    /// Additional topics that receive every message
    #[serde(default)]
    pub extra_topics: Vec<String>,
    /// Give up waiting for messages after this many seconds
    pub receive_timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_publish_error: PublishFailurePolicy,
    /// Keep the endpoint and client id out of the logs
    #[serde(default)]
    pub ci_mode: bool,
}

/// Payload field values
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSection {
    #[serde(default = "default_message_text")]
    pub text: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default = "default_messagetype")]
    pub messagetype: String,
    /// Defaults to the local host name
    pub source: Option<String>,
    /// Instrument temperature, included in the payload when set
    pub temperature: Option<String>,
    #[serde(default)]
    pub shape: PayloadShape,
}

/// What the publish loop does when a single publish fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PublishFailurePolicy {
    /// Log the failure and move on to the next message
    #[default]
    Continue,
    /// Stop publishing and report the error
    Abort,
}

fn default_client_id() -> String {
    format!("test-{}", Uuid::new_v4())
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_topic() -> String {
    "test/topic".to_string()
}

fn default_count() -> u64 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_message_text() -> String {
    "Instrument message".to_string()
}

fn default_subject() -> String {
    "Testing Instrument Events".to_string()
}

fn default_operator() -> String {
    "VN".to_string()
}

fn default_messagetype() -> String {
    "SMS".to_string()
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: None,
            client_id: default_client_id(),
            cert_path: None,
            key_path: None,
            ca_path: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            clean_start: false,
            connect_timeout_secs: default_connect_timeout(),
            proxy_host: None,
            proxy_port: None,
        }
    }
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            count: default_count(),
            interval_ms: default_interval_ms(),
            subscribe: false,
            extra_topics: Vec::new(),
            receive_timeout_secs: None,
            on_publish_error: PublishFailurePolicy::default(),
            ci_mode: false,
        }
    }
}

impl Default for MessageSection {
    fn default() -> Self {
        Self {
            text: default_message_text(),
            subject: default_subject(),
            operator: default_operator(),
            messagetype: default_messagetype(),
            source: None,
            temperature: None,
            shape: PayloadShape::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid topic or client id: {0}")]
    Validation(#[from] ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Values supplied on the command line; `None` keeps the configured value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub topic: Option<String>,
    pub count: Option<u64>,
    pub interval_ms: Option<u64>,
    pub subscribe: bool,
    pub receive_timeout_secs: Option<u64>,
    pub on_publish_error: Option<PublishFailurePolicy>,
    pub ci_mode: bool,
    pub message: Option<String>,
    pub operator: Option<String>,
    pub temperature: Option<String>,
}

/// Resolved broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PubSubConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PubSubConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply command line overrides on top of the loaded values
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            endpoint,
            port,
            client_id,
            cert_path,
            key_path,
            ca_path,
            proxy_host,
            proxy_port,
            topic,
            count,
            interval_ms,
            subscribe,
            receive_timeout_secs,
            on_publish_error,
            ci_mode,
            message,
            operator,
            temperature,
        } = overrides;

        if let Some(endpoint) = endpoint {
            self.mqtt.endpoint = endpoint;
        }
        if port.is_some() {
            self.mqtt.port = port;
        }
        if let Some(client_id) = client_id {
            self.mqtt.client_id = client_id;
        }
        if cert_path.is_some() {
            self.mqtt.cert_path = cert_path;
        }
        if key_path.is_some() {
            self.mqtt.key_path = key_path;
        }
        if ca_path.is_some() {
            self.mqtt.ca_path = ca_path;
        }
        if proxy_host.is_some() {
            self.mqtt.proxy_host = proxy_host;
        }
        if proxy_port.is_some() {
            self.mqtt.proxy_port = proxy_port;
        }
        if let Some(topic) = topic {
            self.publish.topic = topic;
        }
        if let Some(count) = count {
            self.publish.count = count;
        }
        if let Some(interval_ms) = interval_ms {
            self.publish.interval_ms = interval_ms;
        }
        // Flags can only switch these on
        self.publish.subscribe |= subscribe;
        self.publish.ci_mode |= ci_mode;
        if receive_timeout_secs.is_some() {
            self.publish.receive_timeout_secs = receive_timeout_secs;
        }
        if let Some(policy) = on_publish_error {
            self.publish.on_publish_error = policy;
        }
        if let Some(message) = message {
            self.message.text = message;
        }
        if let Some(operator) = operator {
            self.message.operator = operator;
        }
        if temperature.is_some() {
            self.message.temperature = temperature;
        }
    }

    /// Check the final configuration before connecting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.endpoint"));
        }
        self.mqtt.resolve_endpoint()?;
        validate_client_id(&self.mqtt.client_id)?;

        // The primary topic is both published to and subscribed to, so it
        // must be a concrete name
        validate_topic_name(&self.publish.topic)?;
        for topic in &self.publish.extra_topics {
            validate_topic_name(topic)?;
        }

        match (&self.mqtt.cert_path, &self.mqtt.key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "cert and key must be provided together".to_string(),
                ));
            }
            (Some(_), Some(_)) if self.mqtt.ca_path.is_none() => {
                return Err(ConfigError::InvalidConfig(
                    "a CA file is required when using a client certificate".to_string(),
                ));
            }
            _ => {}
        }

        match &self.mqtt.proxy_host {
            Some(host) if host.trim().is_empty() => {
                return Err(ConfigError::InvalidConfig(
                    "proxy_host cannot be empty".to_string(),
                ));
            }
            None if self.mqtt.proxy_port.is_some() => {
                return Err(ConfigError::InvalidConfig(
                    "proxy_port requires proxy_host".to_string(),
                ));
            }
            _ => {}
        }

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// All topics each message is published to, primary topic first
    pub fn publish_targets(&self) -> Vec<String> {
        let mut targets = vec![self.publish.topic.clone()];
        for topic in &self.publish.extra_topics {
            if !targets.contains(topic) {
                targets.push(topic.clone());
            }
        }
        targets
    }

    pub fn message_template(&self) -> MessageTemplate {
        MessageTemplate {
            message: self.message.text.clone(),
            subject: self.message.subject.clone(),
            operator: self.message.operator.clone(),
            messagetype: self.message.messagetype.clone(),
            source: self.message.source.clone().unwrap_or_else(local_hostname),
            temperature: self.message.temperature.clone(),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
endpoint = "localhost"
client_id = "test-client"

[publish]
topic = "test/topic"
count = 3
interval_ms = 0
subscribe = true
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    fn has_client_certificate(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Resolve host, port and TLS use from the endpoint and overrides
    ///
    /// A bare host uses TLS when certificates are configured. The port falls
    /// back to 8883 for TLS and 1883 otherwise.
    pub fn resolve_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let endpoint = self.endpoint.trim();

        let (host, url_port, tls) = if endpoint.contains("://") {
            let url = Url::parse(endpoint)
                .map_err(|_| ConfigError::InvalidEndpoint(endpoint.to_string()))?;
            let tls = match url.scheme() {
                "mqtts" | "ssl" | "tls" => true,
                "mqtt" | "tcp" => false,
                other => {
                    return Err(ConfigError::InvalidEndpoint(format!(
                        "unsupported scheme '{other}' in {endpoint}"
                    )));
                }
            };
            let host = url
                .host_str()
                .ok_or_else(|| ConfigError::InvalidEndpoint(endpoint.to_string()))?
                .to_string();
            (host, url.port(), tls)
        } else {
            if endpoint.is_empty() || endpoint.contains('/') || endpoint.contains(' ') {
                return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
            }
            let tls = self.has_client_certificate() || self.ca_path.is_some();
            (endpoint.to_string(), None, tls)
        };

        let port = self
            .port
            .or(url_port)
            .unwrap_or(if tls { 8883 } else { 1883 });

        Ok(BrokerEndpoint { host, port, tls })
    }

    /// Get MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}
