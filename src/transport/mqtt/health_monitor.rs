//! Pure reconnection and connection-state logic for the MQTT client
//!
//! The event loop task asks these functions how long to back off and which
//! [`ConnectionState`] an event leads to. None of them perform I/O.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{debug, error, info, warn};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to poll the broker again after a failed poll
    ///
    /// `attempts` counts failures since the last CONNACK.
    pub fn next_retry(attempts: u32, config: &ReconnectConfig, closing: bool) -> RetryDecision {
        if closing {
            return RetryDecision::ShuttingDown;
        }
        if config.max_attempts.is_some_and(|max| attempts >= max) {
            return RetryDecision::GiveUp;
        }

        let attempt = attempts + 1;
        RetryDecision::Retry {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker sent DISCONNECT".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Publishing is only attempted on a live connection; while reconnecting
    /// the caller gets an immediate error instead of a queued request
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker accepted connection");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempts = attempt, "Broker connection resumed");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (ConnectionState::Disconnected(_), ConnectionState::Reconnecting(attempt)) => {
                debug!(attempt, "Polling broker again");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "Broker connection cannot be restored");
            }
            _ => {
                debug!(from = ?from, to = ?to, "Connection state changed");
            }
        }
    }

    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1, or unset for unlimited".to_string());
        }
        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of [`HealthMonitor::next_retry`]
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay_ms: u64 },
    /// The client is closing; stop polling
    ShuttingDown,
    /// `max_attempts` reached
    GiveUp,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    /// No more retries; the broker refused or attempts ran out
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_follows_backoff_pattern() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (0..7)
            .map(|attempts| match HealthMonitor::next_retry(attempts, &config, false) {
                RetryDecision::Retry { delay_ms, .. } => delay_ms,
                other => panic!("unexpected decision {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![25, 50, 100, 250, 1000, 2000, 2000]);
    }

    #[test]
    fn test_retry_stops_when_closing() {
        let config = ReconnectConfig::default();
        assert_eq!(
            HealthMonitor::next_retry(3, &config, true),
            RetryDecision::ShuttingDown
        );
    }

    #[test]
    fn test_retry_gives_up_at_max_attempts() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };
        assert_eq!(
            HealthMonitor::next_retry(1, &config, false),
            RetryDecision::Retry {
                attempt: 2,
                delay_ms: 50
            }
        );
        assert_eq!(
            HealthMonitor::next_retry(2, &config, false),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "connection reset".to_string()
            )),
            ConnectionState::Disconnected("connection reset".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "NotAuthorized".to_string()
            )),
            ConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[test]
    fn test_operations_need_live_connection() {
        let states = [
            (ConnectionState::Connected, true),
            (ConnectionState::Connecting, false),
            (ConnectionState::Reconnecting(1), false),
            (ConnectionState::Disconnected("reset".to_string()), false),
            (ConnectionState::PermanentlyDisconnected("refused".to_string()), false),
        ];
        for (state, allowed) in states {
            assert_eq!(HealthMonitor::can_publish(&state), allowed, "{state:?}");
            assert_eq!(HealthMonitor::can_subscribe(&state), allowed, "{state:?}");
        }
    }

    #[test]
    fn test_validate_reconnect_config() {
        assert!(HealthMonitor::validate_reconnect_config(&ReconnectConfig::default()).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_reconnect_config(&zero_attempts).is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay: 0,
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_reconnect_config(&zero_delay).is_err());
    }

    #[test]
    fn test_log_state_transition_covers_all_paths() {
        let transitions = [
            (ConnectionState::Connecting, ConnectionState::Connected),
            (ConnectionState::Reconnecting(3), ConnectionState::Connected),
            (
                ConnectionState::Connected,
                ConnectionState::Disconnected("reset".to_string()),
            ),
            (
                ConnectionState::Disconnected("reset".to_string()),
                ConnectionState::Reconnecting(1),
            ),
            (
                ConnectionState::Connected,
                ConnectionState::PermanentlyDisconnected("refused".to_string()),
            ),
            (ConnectionState::Connecting, ConnectionState::Reconnecting(1)),
        ];
        for (from, to) in transitions {
            HealthMonitor::log_state_transition(&from, &to);
        }
    }
}
