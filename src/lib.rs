//! instrument-pubsub
//!
//! Publishes instrument readings to an MQTT broker and verifies they come
//! back on a subscription, surviving broker disconnections along the way.
//!
//! # Overview
//!
//! - Payload construction and topic validation ([`protocol`])
//! - MQTT v5 transport over `rumqttc` with TLS ([`transport`])
//! - Connection lifecycle coordination and resubscription ([`lifecycle`])
//! - The connect / subscribe / publish / wait flow ([`runner`])
//!
//! # Quick Start
//!
//! ```rust
//! use instrument_pubsub::lifecycle::{Coordinator, Grant, LifecycleState, ResumeAction, Session};
//! use instrument_pubsub::protocol::QoS;
//! use instrument_pubsub::transport::ConnectStatus;
//!
//! let mut coordinator = Coordinator::new(Session::new("test-client"));
//! coordinator.on_connected(false);
//! let grant = Grant::granted("test/topic", QoS::AtLeastOnce);
//! coordinator
//!     .record_subscription("test/topic", QoS::AtLeastOnce, &grant)
//!     .unwrap();
//!
//! // The broker drops the connection and comes back without the session
//! coordinator.on_interrupted("connection reset");
//! let action = coordinator.on_resumed(false, &ConnectStatus::Accepted).unwrap();
//! assert!(matches!(action, ResumeAction::Resubscribe(ref subs) if subs.len() == 1));
//!
//! coordinator.on_resubscribe_complete(&[grant]).unwrap();
//! assert_eq!(coordinator.state(), &LifecycleState::ConnectedReady);
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod runner;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{PubSubError, PubSubResult};
pub use lifecycle::{Coordinator, FatalReason, LifecycleState, ReceiveTracker};
pub use protocol::*;
pub use runner::{PubSubRunner, RunSummary, ShutdownHandle};
pub use transport::mqtt::MqttClient;
