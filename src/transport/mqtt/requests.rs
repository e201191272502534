//! Correlation of SUBSCRIBE requests with their SUBACKs
//!
//! rumqttc assigns packet ids inside the event loop, so a request is first
//! queued in submission order and then bound to its id when the event loop
//! reports `Outgoing::Subscribe`. Both happen in the same order because
//! requests travel through a single channel.

use crate::lifecycle::{Grant, Subscription};
use crate::protocol::QoS;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::{AsyncClient, ClientError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Who is waiting on a SUBACK
#[derive(Debug)]
pub enum RequestKind {
    /// An application subscribe awaiting its grants
    Subscribe {
        responder: oneshot::Sender<Vec<Grant>>,
    },
    /// A lifecycle resubscribe; grants are reported as an event
    Resubscribe,
}

#[derive(Debug)]
pub struct PendingSubscribe {
    pub topics: Vec<Subscription>,
    pub kind: RequestKind,
}

impl PendingSubscribe {
    fn filters(&self) -> Vec<Filter> {
        self.topics
            .iter()
            .map(|s| Filter::new(s.topic.clone(), s.requested.into()))
            .collect()
    }

    fn grants(&self, granted: &[Option<QoS>]) -> Vec<Grant> {
        self.topics
            .iter()
            .enumerate()
            .map(|(index, s)| Grant {
                topic: s.topic.clone(),
                qos: granted.get(index).copied().flatten(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct RequestTable {
    queued: VecDeque<PendingSubscribe>,
    in_flight: HashMap<u16, PendingSubscribe>,
}

#[derive(Debug, Default)]
pub struct SubscribeRequests {
    table: Mutex<RequestTable>,
}

impl SubscribeRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, RequestTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a request and hand it to the client without blocking
    ///
    /// The lock is held across the hand-off so queue order always matches
    /// the order requests reach the event loop.
    pub fn submit(
        &self,
        client: &AsyncClient,
        pending: PendingSubscribe,
    ) -> Result<(), ClientError> {
        let filters = pending.filters();
        let mut table = self.table();
        table.queued.push_back(pending);
        if let Err(e) = client.try_subscribe_many(filters) {
            table.queued.pop_back();
            return Err(e);
        }
        Ok(())
    }

    /// Bind the oldest queued request to the packet id the event loop chose
    pub fn assign_packet_id(&self, packet_id: u16) {
        let mut table = self.table();
        match table.queued.pop_front() {
            Some(pending) => {
                debug!(packet_id, topics = pending.topics.len(), "Subscribe sent");
                table.in_flight.insert(packet_id, pending);
            }
            None => warn!(packet_id, "Subscribe sent with no queued request"),
        }
    }

    /// Resolve a SUBACK
    ///
    /// Application subscribes are answered directly. Resubscribe grants are
    /// returned so the caller can report them as an event.
    pub fn complete(&self, packet_id: u16, granted: &[Option<QoS>]) -> Option<Vec<Grant>> {
        let pending = self.table().in_flight.remove(&packet_id);
        let Some(pending) = pending else {
            warn!(packet_id, "SUBACK for unknown packet id");
            return None;
        };

        let grants = pending.grants(granted);
        match pending.kind {
            RequestKind::Subscribe { responder } => {
                if responder.send(grants).is_err() {
                    debug!(packet_id, "Subscriber stopped waiting for SUBACK");
                }
                None
            }
            RequestKind::Resubscribe => Some(grants),
        }
    }

    /// Drop requests whose SUBACK can no longer arrive after a lost
    /// connection; waiting subscribers observe a closed channel
    pub fn fail_in_flight(&self) -> usize {
        let mut table = self.table();
        let dropped = table.in_flight.len();
        table.in_flight.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        let table = self.table();
        table.queued.len() + table.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::MqttOptions;

    fn client() -> (AsyncClient, rumqttc::v5::EventLoop) {
        AsyncClient::new(MqttOptions::new("test-client", "localhost", 1883), 10)
    }

    fn subscribe(topic: &str) -> (PendingSubscribe, oneshot::Receiver<Vec<Grant>>) {
        let (responder, rx) = oneshot::channel();
        (
            PendingSubscribe {
                topics: vec![Subscription::new(topic, QoS::AtLeastOnce)],
                kind: RequestKind::Subscribe { responder },
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_subscribe_answered_through_responder() {
        let (client, _eventloop) = client();
        let requests = SubscribeRequests::new();
        let (pending, rx) = subscribe("test/topic");

        requests.submit(&client, pending).unwrap();
        requests.assign_packet_id(1);
        assert!(requests
            .complete(1, &[Some(QoS::AtLeastOnce)])
            .is_none());

        let grants = rx.await.unwrap();
        assert_eq!(grants, vec![Grant::granted("test/topic", QoS::AtLeastOnce)]);
        assert_eq!(requests.pending(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_grants_returned() {
        let (client, _eventloop) = client();
        let requests = SubscribeRequests::new();
        let pending = PendingSubscribe {
            topics: vec![
                Subscription::new("a/topic", QoS::AtLeastOnce),
                Subscription::new("b/topic", QoS::AtMostOnce),
            ],
            kind: RequestKind::Resubscribe,
        };

        requests.submit(&client, pending).unwrap();
        requests.assign_packet_id(4);
        let grants = requests.complete(4, &[Some(QoS::AtLeastOnce), None]).unwrap();

        assert_eq!(
            grants,
            vec![
                Grant::granted("a/topic", QoS::AtLeastOnce),
                Grant::rejected("b/topic"),
            ]
        );
    }

    #[tokio::test]
    async fn test_packet_ids_bind_in_submission_order() {
        let (client, _eventloop) = client();
        let requests = SubscribeRequests::new();
        let (first, first_rx) = subscribe("first");
        let (second, second_rx) = subscribe("second");

        requests.submit(&client, first).unwrap();
        requests.submit(&client, second).unwrap();
        requests.assign_packet_id(10);
        requests.assign_packet_id(11);

        requests.complete(11, &[Some(QoS::AtMostOnce)]);
        requests.complete(10, &[Some(QoS::AtLeastOnce)]);

        assert_eq!(first_rx.await.unwrap()[0].topic, "first");
        assert_eq!(second_rx.await.unwrap()[0].topic, "second");
    }

    #[tokio::test]
    async fn test_short_suback_counts_as_rejection() {
        let (client, _eventloop) = client();
        let requests = SubscribeRequests::new();
        let (pending, rx) = subscribe("test/topic");

        requests.submit(&client, pending).unwrap();
        requests.assign_packet_id(2);
        requests.complete(2, &[]);

        assert!(rx.await.unwrap()[0].is_rejected());
    }

    #[tokio::test]
    async fn test_fail_in_flight_closes_waiters() {
        let (client, _eventloop) = client();
        let requests = SubscribeRequests::new();
        let (pending, rx) = subscribe("test/topic");

        requests.submit(&client, pending).unwrap();
        requests.assign_packet_id(3);
        assert_eq!(requests.fail_in_flight(), 1);

        assert!(rx.await.is_err());
        assert!(requests.complete(3, &[Some(QoS::AtLeastOnce)]).is_none());
    }

    #[tokio::test]
    async fn test_submit_rolls_back_when_client_closed() {
        let (client, eventloop) = client();
        drop(eventloop);
        let requests = SubscribeRequests::new();
        let (pending, _rx) = subscribe("test/topic");

        assert!(requests.submit(&client, pending).is_err());
        assert_eq!(requests.pending(), 0);
    }
}
