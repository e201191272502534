//! Message types carried over MQTT
//!
//! The instrument payload is plain JSON. Its shape is an application-level
//! convention, not something the broker enforces.

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Quality of service level for publishes and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as used on the wire
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

/// A message handed to the transport for a single publish call
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }
}

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
}

impl InboundMessage {
    /// Payload as text for logging, lossy on invalid UTF-8
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// How the instrument message is wrapped on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
    /// A bare JSON object
    #[default]
    Object,
    /// A JSON array holding a single object
    Array,
}

/// Instrument event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMessage {
    pub datetime: String,
    pub message: String,
    pub subject: String,
    pub operator: String,
    pub messagetype: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<String>,
}

impl InstrumentMessage {
    /// Serialize into the configured wire shape
    pub fn encode(&self, shape: PayloadShape) -> Result<Vec<u8>, serde_json::Error> {
        match shape {
            PayloadShape::Object => serde_json::to_vec(self),
            PayloadShape::Array => serde_json::to_vec(&[self]),
        }
    }

    /// Parse a payload in either shape
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<Self>(payload) {
            Ok(message) => Ok(message),
            Err(object_err) => match serde_json::from_slice::<[Self; 1]>(payload) {
                Ok([message]) => Ok(message),
                Err(_) => Err(object_err),
            },
        }
    }
}

/// Static fields used to build a fresh [`InstrumentMessage`] per publish
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub message: String,
    pub subject: String,
    pub operator: String,
    pub messagetype: String,
    pub source: String,
    pub temperature: Option<String>,
}

impl MessageTemplate {
    pub fn build(&self, now: DateTime<Local>) -> InstrumentMessage {
        InstrumentMessage {
            datetime: format_timestamp(now),
            message: self.message.clone(),
            subject: self.subject.clone(),
            operator: self.operator.clone(),
            messagetype: self.messagetype.clone(),
            source: self.source.clone(),
            temperature: self.temperature.clone(),
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS.ffffff` in local time
pub fn format_timestamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Kernel host name for the `source` field
pub fn local_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        "unknown-host".to_string()
    } else {
        name
    }
}
