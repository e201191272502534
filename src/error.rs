//! Error types for the publish/subscribe run
//!
//! Layer-specific errors ([`ConfigError`], `MqttError`, [`FatalReason`]) are
//! folded into [`PubSubError`] at the application boundary.

use crate::config::ConfigError;
use crate::lifecycle::FatalReason;
use std::time::Duration;
use thiserror::Error;

/// Main error type for a publish/subscribe run
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Server rejected subscription to topic: {topic}")]
    SubscriptionRejected { topic: String },

    #[error("Publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Session failed: {0}")]
    Fatal(#[from] FatalReason),

    #[error("Received {received} of {expected} messages before timing out after {timeout:?}")]
    ReceiveTimeout {
        received: u64,
        expected: u64,
        timeout: Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PubSubError {
    pub fn connect<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connect(Box::new(error))
    }

    pub fn subscribe<E>(topic: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Subscribe {
            topic: topic.into(),
            source: Box::new(error),
        }
    }

    pub fn publish<E>(topic: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Publish {
            topic: topic.into(),
            source: Box::new(error),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for publish/subscribe operations
pub type PubSubResult<T> = Result<T, PubSubError>;
