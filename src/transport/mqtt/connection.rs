//! Connection state, reconnect backoff and `MqttOptions` construction
//!
//! Nothing here touches the network. The `[mqtt]` config section becomes
//! rumqttc options with TLS set up from the configured certificate files.

use crate::config::{ConfigError, MqttSection};
use crate::protocol::ValidationError;
use rumqttc::v5::MqttOptions;
use rumqttc::{Proxy, ProxyAuth, ProxyType, TlsConfiguration, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Maximum MQTT packet size accepted by the broker
pub const MAX_PACKET_SIZE: u32 = 128 * 1024;

/// Proxy port used when only `proxy_host` is configured
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// ALPN protocol that lets AWS IoT Core accept client-certificate MQTT on 443
pub const AWS_IOT_ALPN: &[u8] = b"x-amzn-mqtt-ca";

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    /// CONNACK received
    Connected,
    Disconnected(String),
    /// Waiting out backoff before poll attempt N
    Reconnecting(u32),
    /// Permanently disconnected - the broker refused us or retries ran out
    PermanentlyDisconnected(String),
}

/// Backoff between event loop polls after the connection drops
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// `None` retries until shutdown
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once `backoff_pattern` runs out
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250, 1000],
            sustained_delay: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),
    #[error("Timed out after {0:?} waiting for the broker")]
    Timeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(#[from] ConfigError),
    #[error("Failed to read {path}")]
    CertificateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid topic")]
    InvalidTopic(#[source] ValidationError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::CertificateRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Build the TLS transport for the configured certificates
///
/// Without a CA file the platform's default roots are used, which only works
/// when no client certificate is required.
pub fn configure_tls(config: &MqttSection, port: u16) -> Result<RumqttcTransport, MqttError> {
    let alpn = (port == 443).then(|| vec![AWS_IOT_ALPN.to_vec()]);

    let Some(ca_path) = &config.ca_path else {
        return Ok(RumqttcTransport::tls_with_default_config());
    };

    let ca = read_pem(ca_path)?;
    let client_auth = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(RumqttcTransport::Tls(TlsConfiguration::Simple {
        ca,
        alpn,
        client_auth,
    }))
}

/// Build rumqttc options for the configured endpoint, TLS files and credentials
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let endpoint = config.resolve_endpoint()?;

    let mut mqtt_options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(configure_tls(config, endpoint.port)?);
    }

    if let Some(host) = &config.proxy_host {
        mqtt_options.set_proxy(Proxy {
            ty: ProxyType::Http,
            auth: ProxyAuth::None,
            addr: host.clone(),
            port: config.proxy_port.unwrap_or(DEFAULT_PROXY_PORT),
        });
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(config.clean_start);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250, 1000]);
        assert_eq!(config.sustained_delay, 2000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(5), 1000);

        assert_eq!(config.calculate_backoff_delay(6), 2000);
        assert_eq!(config.calculate_backoff_delay(100), 2000);
    }

    #[test]
    fn test_empty_backoff_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 500,
        };
        assert_eq!(config.calculate_backoff_delay(1), 500);
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            endpoint: "localhost".to_string(),
            port: Some(1883),
            client_id: "test-client".to_string(),
            ..MqttSection::default()
        }
    }

    #[test]
    fn test_configure_plain_options() {
        let options = configure_mqtt_options(&test_mqtt_config()).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.client_id(), "test-client");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_start());
    }

    #[test]
    fn test_proxy_is_applied() {
        let mut config = test_mqtt_config();
        assert!(configure_mqtt_options(&config).unwrap().proxy().is_none());

        config.proxy_host = Some("proxy.internal".to_string());
        let proxy = configure_mqtt_options(&config)
            .unwrap()
            .proxy()
            .expect("proxy configured");
        assert_eq!(proxy.addr, "proxy.internal");
        assert_eq!(proxy.port, DEFAULT_PROXY_PORT);
        assert!(matches!(proxy.ty, ProxyType::Http));

        config.proxy_port = Some(3128);
        let proxy = configure_mqtt_options(&config).unwrap().proxy().unwrap();
        assert_eq!(proxy.port, 3128);
    }

    #[test]
    fn test_invalid_endpoint() {
        let mut config = test_mqtt_config();
        config.endpoint = "ftp://broker".to_string();

        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(MqttError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_missing_certificate_file() {
        let mut config = test_mqtt_config();
        config.port = Some(8883);
        config.ca_path = Some(PathBuf::from("/nonexistent/root-CA.crt"));

        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(MqttError::CertificateRead { .. })));
    }

    #[test]
    fn test_tls_with_certificate_files() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str| {
            let path = dir.path().join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
            path
        };

        let mut config = test_mqtt_config();
        config.port = Some(443);
        config.ca_path = Some(write("root-CA.crt"));
        config.cert_path = Some(write("device.pem.crt"));
        config.key_path = Some(write("private.pem.key"));

        match configure_tls(&config, 443).unwrap() {
            RumqttcTransport::Tls(TlsConfiguration::Simple {
                alpn, client_auth, ..
            }) => {
                assert_eq!(alpn, Some(vec![AWS_IOT_ALPN.to_vec()]));
                assert!(client_auth.is_some());
            }
            _ => panic!("expected simple TLS configuration"),
        }
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::ConnectionRefused("NotAuthorized".to_string()),
            MqttError::Timeout(Duration::from_secs(1)),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
