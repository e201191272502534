//! Testing utilities and mock implementations
//!
//! This module provides a mock transport for exercising the lifecycle and
//! the runner without an MQTT broker.

pub mod mocks;

pub use mocks::*;
