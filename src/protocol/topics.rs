//! Topic validation and matching for MQTT topic names and filters
//!
//! Publish targets must be concrete topic names. Subscriptions accept filters
//! with the `+` and `#` wildcards.

use thiserror::Error;

/// Maximum client identifier length accepted by AWS IoT Core
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Validation errors for topics and client identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic name '{0}' must not contain wildcards")]
    WildcardInTopicName(String),
    #[error("Topic filter '{0}' has a misplaced wildcard")]
    MisplacedWildcard(String),
    #[error("Topic contains a null character")]
    NullCharacter,
    #[error("Client ID cannot be empty")]
    EmptyClientId,
    #[error("Client ID exceeds {MAX_CLIENT_ID_LEN} characters")]
    ClientIdTooLong,
    #[error("Client ID contains invalid character {0:?}")]
    InvalidClientIdChar(char),
}

/// Validate a topic name used as a publish target
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.contains('\0') {
        return Err(ValidationError::NullCharacter);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(ValidationError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription topic filter
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if filter.contains('\0') {
        return Err(ValidationError::NullCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let is_last = index == levels.len() - 1;
        match *level {
            "#" if is_last => {}
            "+" => {}
            other if other.contains('+') || other.contains('#') => {
                return Err(ValidationError::MisplacedWildcard(filter.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check whether a concrete topic name matches a subscription filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Topics starting with '$' are never matched by leading wildcards
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_client_id(client_id: &str) -> Result<(), ValidationError> {
    if client_id.is_empty() {
        return Err(ValidationError::EmptyClientId);
    }
    if client_id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::ClientIdTooLong);
    }
    if let Some(bad) = client_id
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '+' | '#' | '/'))
    {
        return Err(ValidationError::InvalidClientIdChar(bad));
    }
    Ok(())
}
