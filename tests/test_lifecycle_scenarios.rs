//! End-to-end lifecycle scenarios over the mock transport
//!
//! Drives the dispatcher, coordinator and receive tracker through the same
//! event channel the MQTT transport uses, with the mock standing in for the
//! broker.

use instrument_pubsub::lifecycle::{
    Coordinator, EventDispatcher, FatalReason, Grant, LifecycleState, ReceiveTracker,
    Session, Subscription, WaitOutcome,
};
use instrument_pubsub::protocol::{OutboundMessage, QoS};
use instrument_pubsub::testing::{wait_until, MockTransport};
use instrument_pubsub::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const TOPIC: &str = "test/topic";
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    transport: MockTransport,
    coordinator: Arc<Mutex<Coordinator>>,
    tracker: Arc<ReceiveTracker>,
    fatal_rx: watch::Receiver<Option<FatalReason>>,
    dispatcher: JoinHandle<()>,
}

impl Harness {
    /// Connected and subscribed to `test/topic` at QoS 1
    async fn subscribed(expected_messages: u64) -> Self {
        let mut transport = MockTransport::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.set_event_sender(event_tx);

        let coordinator = Arc::new(Mutex::new(Coordinator::new(Session::new("test-client"))));
        let tracker = Arc::new(ReceiveTracker::new(expected_messages));
        let (dispatcher, fatal_rx) = EventDispatcher::new(
            coordinator.clone(),
            tracker.clone(),
            transport.resubscriber(),
        );
        let dispatcher = dispatcher.spawn(event_rx);

        transport.connect().await.expect("mock connect");
        let grant = transport
            .subscribe(TOPIC, QoS::AtLeastOnce)
            .await
            .expect("mock subscribe");
        coordinator
            .lock()
            .await
            .record_subscription(TOPIC, QoS::AtLeastOnce, &grant)
            .expect("subscription granted");

        Self {
            transport,
            coordinator,
            tracker,
            fatal_rx,
            dispatcher,
        }
    }

    async fn publish(&self, count: usize) {
        for i in 0..count {
            self.transport
                .publish(OutboundMessage::new(
                    TOPIC,
                    format!("message {i}"),
                    QoS::AtLeastOnce,
                ))
                .await
                .expect("mock publish");
        }
    }

    async fn wait_for_state(&self, expected: LifecycleState) -> bool {
        let coordinator = self.coordinator.clone();
        wait_until(
            move || {
                coordinator
                    .try_lock()
                    .map(|c| *c.state() == expected)
                    .unwrap_or(false)
            },
            WAIT,
        )
        .await
    }

    async fn wait_for_fatal(&mut self) -> Option<FatalReason> {
        let result = tokio::time::timeout(WAIT, self.fatal_rx.wait_for(|r| r.is_some())).await;
        match result {
            Ok(Ok(reason)) => reason.clone(),
            _ => None,
        }
    }
}

#[tokio::test]
async fn test_round_trip_sets_completion() {
    let harness = Harness::subscribed(3).await;
    harness.publish(3).await;

    let outcome = harness.tracker.wait_for_all(Some(WAIT)).await;

    assert_eq!(outcome, WaitOutcome::Completed);
    assert_eq!(harness.tracker.received(), 3);
    assert!(harness.tracker.is_complete());
}

#[tokio::test]
async fn test_resume_without_session_resubscribes_once() {
    let harness = Harness::subscribed(0).await;

    harness.transport.interrupt("connection reset by peer");
    assert!(harness.wait_for_state(LifecycleState::Disconnected).await);

    harness.transport.resume(false);
    assert!(harness.wait_for_state(LifecycleState::ConnectedReady).await);

    let requests = harness.transport.get_resubscribe_requests();
    assert_eq!(requests.len(), 1, "exactly one resubscribe request");
    assert_eq!(
        requests[0],
        vec![Subscription::new(TOPIC, QoS::AtLeastOnce)]
    );

    let coordinator = harness.coordinator.lock().await;
    assert_eq!(coordinator.interruptions(), 1);
    assert_eq!(
        coordinator.last_interruption(),
        Some("connection reset by peer")
    );
    let subscription = coordinator.session().subscriptions().next().cloned();
    assert_eq!(
        subscription.map(|s| s.granted),
        Some(Some(QoS::AtLeastOnce))
    );
}

#[tokio::test]
async fn test_resume_with_session_keeps_subscriptions() {
    let harness = Harness::subscribed(0).await;

    harness.transport.interrupt("keep alive timeout");
    harness.transport.resume(true);

    assert!(
        harness
            .wait_for_state(LifecycleState::ConnectedSessionPersisted)
            .await
    );
    assert!(harness.transport.get_resubscribe_requests().is_empty());
    assert_eq!(
        harness.coordinator.lock().await.session().subscriptions().count(),
        1
    );
}

#[tokio::test]
async fn test_rejected_resubscribe_is_fatal() {
    let mut harness = Harness::subscribed(3).await;
    harness.transport.reject_topic(TOPIC);

    harness.transport.interrupt("broker restarted");
    harness.transport.resume(false);

    let reason = harness.wait_for_fatal().await;
    assert_eq!(
        reason,
        Some(FatalReason::SubscriptionRejected {
            topic: TOPIC.to_string()
        })
    );
    assert!(reason
        .map(|r| r.to_string().contains(TOPIC))
        .unwrap_or(false));

    // Pending waits are released and the dispatcher stops
    assert_eq!(
        harness.tracker.wait_for_all(Some(WAIT)).await,
        WaitOutcome::Cancelled
    );
    assert!(tokio::time::timeout(WAIT, harness.dispatcher).await.is_ok());
    assert!(harness.coordinator.lock().await.state().is_fatal());
}

#[tokio::test]
async fn test_refused_resume_is_fatal() {
    let mut harness = Harness::subscribed(0).await;

    harness.transport.interrupt("connection reset");
    harness.transport.resume_refused("NotAuthorized");

    assert!(matches!(
        harness.wait_for_fatal().await,
        Some(FatalReason::ConnectionRejected { .. })
    ));
    assert!(harness.transport.get_resubscribe_requests().is_empty());
}

#[tokio::test]
async fn test_repeated_outages_each_resubscribe() {
    let harness = Harness::subscribed(0).await;

    for _ in 0..3 {
        harness.transport.interrupt("flaky network");
        assert!(harness.wait_for_state(LifecycleState::Disconnected).await);
        harness.transport.resume(false);
        assert!(harness.wait_for_state(LifecycleState::ConnectedReady).await);
    }

    assert_eq!(harness.transport.get_resubscribe_requests().len(), 3);
    assert_eq!(harness.coordinator.lock().await.resubscribe_requests(), 3);
}

#[tokio::test]
async fn test_messages_after_resume_still_count() {
    let harness = Harness::subscribed(4).await;
    harness.publish(2).await;

    harness.transport.interrupt("connection reset");
    harness.transport.resume(false);
    assert!(harness.wait_for_state(LifecycleState::ConnectedReady).await);

    harness.publish(2).await;
    assert_eq!(
        harness.tracker.wait_for_all(Some(WAIT)).await,
        WaitOutcome::Completed
    );
    assert_eq!(harness.tracker.received(), 4);
}

#[tokio::test]
async fn test_state_waits_for_resubscribe_grants() {
    let harness = Harness::subscribed(0).await;
    harness.transport.set_auto_grant(false);

    harness.transport.interrupt("connection reset");
    harness.transport.resume(false);
    assert!(
        harness
            .wait_for_state(LifecycleState::ConnectedResubscribing)
            .await
    );
    assert_eq!(harness.transport.get_resubscribe_requests().len(), 1);

    harness
        .transport
        .complete_resubscribe(vec![Grant::granted(TOPIC, QoS::AtLeastOnce)]);
    assert!(harness.wait_for_state(LifecycleState::ConnectedReady).await);
}
