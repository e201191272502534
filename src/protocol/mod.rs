//! Message payloads and topic rules
//!
//! Everything here is independent of the MQTT client library.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
