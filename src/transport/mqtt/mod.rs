//! MQTT v5 client implementation
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, reconnect backoff and client options
//! - [`event_router`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`requests`] - SUBSCRIBE/SUBACK correlation
//! - [`client`] - The event loop task and the `Transport` implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use instrument_pubsub::config::MqttSection;
//! use instrument_pubsub::protocol::{OutboundMessage, QoS};
//! use instrument_pubsub::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     endpoint: "mqtt://localhost:1883".to_string(),
//!     ..MqttSection::default()
//! };
//!
//! let mut client = MqttClient::new(config)?;
//! client.connect().await?;
//! client.subscribe("test/topic", QoS::AtLeastOnce).await?;
//! client
//!     .publish(OutboundMessage::new("test/topic", "hello", QoS::AtLeastOnce))
//!     .await?;
//! client.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod event_router;
pub mod health_monitor;
pub mod requests;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
pub use event_router::{EventRoute, EventRouter};
pub use health_monitor::{ConnectionEvent, HealthMonitor, RetryDecision};
