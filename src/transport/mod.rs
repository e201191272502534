//! Transport layer for publish/subscribe traffic
//!
//! This module provides the transport abstraction the runner is written
//! against, the events a transport reports back, and the MQTT implementation.

use crate::lifecycle::{Grant, Subscription};
use crate::protocol::{InboundMessage, OutboundMessage, QoS};
use std::sync::Arc;

pub mod mqtt;

/// Broker verdict on a connect or reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectStatus {
    Accepted,
    /// Reason code reported by the broker
    Refused(String),
}

impl std::fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectStatus::Accepted => f.write_str("accepted"),
            ConnectStatus::Refused(code) => write!(f, "refused ({code})"),
        }
    }
}

/// Signals a transport delivers to the event dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Initial connect acknowledged
    Connected { session_present: bool },
    /// Connection lost; the transport is retrying on its own
    Interrupted { reason: String },
    /// Connection re-established after an interruption
    Resumed {
        session_present: bool,
        status: ConnectStatus,
    },
    MessageReceived(InboundMessage),
    /// Broker answer to a resubscribe request, one grant per topic
    ResubscribeComplete(Vec<Grant>),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;

/// Issues resubscribe requests without waiting for the broker
///
/// Called from the event path, so implementations must not block. The answer
/// arrives later as [`TransportEvent::ResubscribeComplete`].
pub trait Resubscriber: Send + Sync {
    fn request_resubscribe(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Transport trait for broker communication
///
/// This trait provides an abstraction over the broker connection (primarily
/// MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker; returns the broker's session-present flag
    async fn connect(&mut self) -> Result<bool, Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter and wait for the broker's grant
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<Grant, Self::Error>;

    /// Publish one message
    async fn publish(&self, message: OutboundMessage) -> Result<(), Self::Error>;

    /// Handle used by the event path to re-establish subscriptions
    fn resubscriber(&self) -> Arc<dyn Resubscriber>;

    /// Set the channel that receives lifecycle and message events; must be
    /// called before `connect`
    fn set_event_sender(&mut self, sender: EventSender);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<mqtt::ConnectionState>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
