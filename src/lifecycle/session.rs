//! Logical MQTT session and its subscription set

use crate::protocol::QoS;
use std::collections::BTreeMap;

/// A topic filter subscription owned by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// QoS asked for in the original subscribe request
    pub requested: QoS,
    /// QoS the broker last granted, `None` until acknowledged
    pub granted: Option<QoS>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, requested: QoS) -> Self {
        Self {
            topic: topic.into(),
            requested,
            granted: None,
        }
    }
}

/// Broker response for one topic of a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub topic: String,
    /// `None` means the broker rejected the subscription
    pub qos: Option<QoS>,
}

impl Grant {
    pub fn granted(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos: Some(qos),
        }
    }

    pub fn rejected(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.qos.is_none()
    }
}

/// One logical connection identity to the broker
#[derive(Debug, Clone)]
pub struct Session {
    client_id: String,
    session_present: bool,
    subscriptions: BTreeMap<String, Subscription>,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_present: false,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Flag reported by the broker on the most recent connect or resume
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub fn set_session_present(&mut self, present: bool) {
        self.session_present = present;
    }

    /// Record a subscribe request; a repeated topic keeps its newest QoS
    pub fn record_request(&mut self, topic: &str, requested: QoS) {
        self.subscriptions
            .insert(topic.to_string(), Subscription::new(topic, requested));
    }

    /// Store a broker grant against its subscription
    ///
    /// A rejected grant removes the subscription, since it is no longer
    /// active. Returns false for topics the session never requested.
    pub fn apply_grant(&mut self, grant: &Grant) -> bool {
        match grant.qos {
            Some(qos) => match self.subscriptions.get_mut(&grant.topic) {
                Some(subscription) => {
                    subscription.granted = Some(qos);
                    true
                }
                None => false,
            },
            None => self.subscriptions.remove(&grant.topic).is_some(),
        }
    }

    pub fn subscription(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions.get(topic)
    }

    /// Subscriptions in topic order
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Every subscription with its originally requested QoS, ready to re-issue
    pub fn resubscribe_set(&self) -> Vec<Subscription> {
        self.subscriptions
            .values()
            .map(|s| Subscription::new(s.topic.clone(), s.requested))
            .collect()
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drop all session state after a deliberate disconnect
    pub fn clear(&mut self) {
        self.session_present = false;
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_empty() {
        let session = Session::new("test-client");
        assert_eq!(session.client_id(), "test-client");
        assert!(!session.session_present());
        assert!(session.is_empty());
        assert!(!session.has_subscriptions());
    }

    #[test]
    fn test_grant_recorded_against_request() {
        let mut session = Session::new("c");
        session.record_request("test/topic", QoS::AtLeastOnce);

        assert!(session.apply_grant(&Grant::granted("test/topic", QoS::AtMostOnce)));

        let subscription = session.subscription("test/topic").unwrap();
        assert_eq!(subscription.requested, QoS::AtLeastOnce);
        assert_eq!(subscription.granted, Some(QoS::AtMostOnce));
    }

    #[test]
    fn test_rejected_grant_removes_subscription() {
        let mut session = Session::new("c");
        session.record_request("test/topic", QoS::AtLeastOnce);

        assert!(session.apply_grant(&Grant::rejected("test/topic")));
        assert!(session.subscription("test/topic").is_none());
    }

    #[test]
    fn test_grant_for_unknown_topic_ignored() {
        let mut session = Session::new("c");
        assert!(!session.apply_grant(&Grant::granted("other", QoS::AtLeastOnce)));
        assert!(session.is_empty());
    }

    #[test]
    fn test_resubscribe_set_keeps_requested_qos() {
        let mut session = Session::new("c");
        session.record_request("b/topic", QoS::AtMostOnce);
        session.record_request("a/topic", QoS::AtLeastOnce);
        session.apply_grant(&Grant::granted("a/topic", QoS::AtMostOnce));

        let set = session.resubscribe_set();
        assert_eq!(
            set,
            vec![
                Subscription::new("a/topic", QoS::AtLeastOnce),
                Subscription::new("b/topic", QoS::AtMostOnce),
            ]
        );
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut session = Session::new("c");
        session.set_session_present(true);
        session.record_request("a", QoS::AtLeastOnce);
        session.clear();

        assert!(!session.session_present());
        assert!(session.is_empty());
        assert_eq!(session.client_id(), "c");
    }
}
