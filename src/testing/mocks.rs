//! Mock transport for testing
//!
//! Behaves like a cooperative broker: published messages are looped back to
//! matching subscriptions and resubscribe requests are answered with grants.
//! Tests can also inject interruptions and resumptions to drive the
//! lifecycle without a network.

use crate::lifecycle::{Grant, Subscription};
use crate::protocol::{topic_matches, InboundMessage, OutboundMessage, QoS};
use crate::transport::{
    mqtt::ConnectionState, ConnectStatus, EventSender, Resubscriber, Transport, TransportEvent,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    #[error("Mock connection failure")]
    Connect,
    #[error("Mock publish failure")]
    Publish,
    #[error("Mock transport not connected")]
    NotConnected,
}

#[derive(Debug, Default)]
struct EventSlot {
    sender: StdMutex<Option<EventSender>>,
}

impl EventSlot {
    fn set(&self, sender: EventSender) {
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|sender| sender.send(event).is_ok())
            .unwrap_or(false)
    }
}

/// Mock transport for testing
#[derive(Debug, Clone)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<OutboundMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub resubscribe_requests: Arc<StdMutex<Vec<Vec<Subscription>>>>,
    pub rejected_topics: Arc<StdMutex<HashSet<String>>>,
    pub should_fail_connect: bool,
    pub should_fail_publish: Arc<AtomicBool>,
    /// Answer resubscribe requests immediately
    pub auto_grant: Arc<AtomicBool>,
    /// Deliver published messages back to matching subscriptions
    pub loopback: Arc<AtomicBool>,
    session_present: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    disconnects: Arc<AtomicUsize>,
    events: Arc<EventSlot>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Arc::default(),
            subscriptions: Arc::default(),
            resubscribe_requests: Arc::default(),
            rejected_topics: Arc::default(),
            should_fail_connect: false,
            should_fail_publish: Arc::new(AtomicBool::new(false)),
            auto_grant: Arc::new(AtomicBool::new(true)),
            loopback: Arc::new(AtomicBool::new(true)),
            session_present: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            disconnects: Arc::new(AtomicUsize::new(0)),
            events: Arc::default(),
        }
    }

    pub fn with_connect_failure() -> Self {
        Self {
            should_fail_connect: true,
            ..Self::new()
        }
    }

    pub fn with_session_present(self, present: bool) -> Self {
        self.session_present.store(present, Ordering::SeqCst);
        self
    }

    pub fn without_loopback(self) -> Self {
        self.loopback.store(false, Ordering::SeqCst);
        self
    }

    /// Reject every future subscribe or resubscribe for `topic`
    pub fn reject_topic(&self, topic: &str) {
        self.rejected_topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.should_fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_auto_grant(&self, grant: bool) {
        self.auto_grant.store(grant, Ordering::SeqCst);
    }

    pub async fn get_published(&self) -> Vec<OutboundMessage> {
        self.published.lock().await.clone()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub fn get_resubscribe_requests(&self) -> Vec<Vec<Subscription>> {
        self.resubscribe_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate a lost connection
    pub fn interrupt(&self, reason: &str) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(TransportEvent::Interrupted {
            reason: reason.to_string(),
        })
    }

    /// Simulate an accepted reconnection
    pub fn resume(&self, session_present: bool) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit(TransportEvent::Resumed {
            session_present,
            status: ConnectStatus::Accepted,
        })
    }

    /// Simulate the broker refusing a reconnection
    pub fn resume_refused(&self, code: &str) -> bool {
        self.events.emit(TransportEvent::Resumed {
            session_present: false,
            status: ConnectStatus::Refused(code.to_string()),
        })
    }

    /// Answer an outstanding resubscribe request by hand
    pub fn complete_resubscribe(&self, grants: Vec<Grant>) -> bool {
        self.events.emit(TransportEvent::ResubscribeComplete(grants))
    }

    /// Deliver a message as if the broker had sent it
    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.events.emit(TransportEvent::MessageReceived(message))
    }

    fn is_rejected(&self, topic: &str) -> bool {
        self.rejected_topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(topic)
    }
}

/// Records resubscribe requests and answers them like a broker would
struct MockResubscriber {
    transport: MockTransport,
}

impl Resubscriber for MockResubscriber {
    fn request_resubscribe(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.transport
            .resubscribe_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriptions.to_vec());

        if self.transport.auto_grant.load(Ordering::SeqCst) {
            let grants = subscriptions
                .iter()
                .map(|s| {
                    if self.transport.is_rejected(&s.topic) {
                        Grant::rejected(s.topic.clone())
                    } else {
                        Grant::granted(s.topic.clone(), s.requested)
                    }
                })
                .collect();
            self.transport.complete_resubscribe(grants);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockError;

    async fn connect(&mut self) -> Result<bool, Self::Error> {
        if self.should_fail_connect {
            return Err(MockError::Connect);
        }
        let session_present = self.session_present.load(Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.events
            .emit(TransportEvent::Connected { session_present });
        Ok(session_present)
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<Grant, Self::Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MockError::NotConnected);
        }
        if self.is_rejected(topic) {
            return Ok(Grant::rejected(topic));
        }
        self.subscriptions.lock().await.push((topic.to_string(), qos));
        Ok(Grant::granted(topic, qos))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), Self::Error> {
        if self.should_fail_publish.load(Ordering::SeqCst) {
            return Err(MockError::Publish);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MockError::NotConnected);
        }

        self.published.lock().await.push(message.clone());

        if self.loopback.load(Ordering::SeqCst) {
            let subscriptions = self.subscriptions.lock().await.clone();
            for (filter, granted) in subscriptions {
                if topic_matches(&filter, &message.topic) {
                    self.deliver(InboundMessage {
                        topic: message.topic.clone(),
                        payload: message.payload.clone(),
                        qos: granted.min(message.qos),
                        dup: false,
                        retain: message.retain,
                    });
                }
            }
        }
        Ok(())
    }

    fn resubscriber(&self) -> Arc<dyn Resubscriber> {
        Arc::new(MockResubscriber {
            transport: self.clone(),
        })
    }

    fn set_event_sender(&mut self, sender: EventSender) {
        self.events.set(sender);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.connected.load(Ordering::SeqCst) {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_loops_back_to_subscription() {
        let mut transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sender(tx);

        transport.connect().await.unwrap();
        transport.subscribe("test/+", QoS::AtLeastOnce).await.unwrap();
        transport
            .publish(OutboundMessage::new("test/topic", "hello", QoS::AtLeastOnce))
            .await
            .unwrap();
        transport
            .publish(OutboundMessage::new("other/topic", "ignored", QoS::AtLeastOnce))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Connected { .. })
        ));
        match rx.recv().await {
            Some(TransportEvent::MessageReceived(message)) => {
                assert_eq!(message.topic, "test/topic");
                assert_eq!(message.payload_text(), "hello");
            }
            other => panic!("expected a delivered message, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.get_published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_topic() {
        let mut transport = MockTransport::new();
        transport.reject_topic("test/topic");
        transport.connect().await.unwrap();

        let grant = transport.subscribe("test/topic", QoS::AtLeastOnce).await.unwrap();
        assert!(grant.is_rejected());
        assert!(transport.get_subscriptions().await.is_empty());

        transport.subscribe("test/other", QoS::AtMostOnce).await.unwrap();
        assert_eq!(
            transport.get_subscriptions().await,
            vec![("test/other".to_string(), QoS::AtMostOnce)]
        );
    }

    #[tokio::test]
    async fn test_connect_reports_session_present() {
        let mut transport = MockTransport::new().with_session_present(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sender(tx);

        assert_eq!(transport.connect().await, Ok(true));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Connected {
                session_present: true
            })
        );
    }

    #[tokio::test]
    async fn test_resubscriber_answers_with_grants() {
        let mut transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sender(tx);

        transport
            .resubscriber()
            .request_resubscribe(&[Subscription::new("test/topic", QoS::AtLeastOnce)])
            .unwrap();

        assert_eq!(transport.get_resubscribe_requests().len(), 1);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::ResubscribeComplete(vec![Grant::granted(
                "test/topic",
                QoS::AtLeastOnce
            )]))
        );
    }

    #[tokio::test]
    async fn test_failures() {
        let mut failing = MockTransport::with_connect_failure();
        assert_eq!(failing.connect().await, Err(MockError::Connect));

        let mut transport = MockTransport::new();
        transport.connect().await.unwrap();
        transport.set_publish_failure(true);
        assert_eq!(
            transport
                .publish(OutboundMessage::new("t", "x", QoS::AtMostOnce))
                .await,
            Err(MockError::Publish)
        );
    }

    #[tokio::test]
    async fn test_wait_until() {
        assert!(wait_until(|| true, Duration::from_millis(10)).await);
        assert!(!wait_until(|| false, Duration::from_millis(20)).await);
    }
}
