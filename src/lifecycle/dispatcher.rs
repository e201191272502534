//! Event dispatcher
//!
//! Single consumer of [`TransportEvent`]s. Each event is applied to the
//! coordinator or the receive tracker in arrival order, so the coordinator
//! never observes two signals at once. Resubscribe requests are handed to the
//! transport without waiting for the broker's answer, which comes back later
//! as another event on the same channel.
//!
//! After every event the dispatcher republishes whether the coordinator
//! considers the connection usable, so the application can hold publishing
//! while a lost session is being restored.

use super::completion::ReceiveTracker;
use super::coordinator::{Coordinator, FatalReason, ResumeAction};
use crate::transport::{EventReceiver, Resubscriber, TransportEvent};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct EventDispatcher {
    coordinator: Arc<Mutex<Coordinator>>,
    tracker: Arc<ReceiveTracker>,
    resubscriber: Arc<dyn Resubscriber>,
    fatal_tx: watch::Sender<Option<FatalReason>>,
    usable_tx: watch::Sender<bool>,
}

impl EventDispatcher {
    /// Returns the dispatcher and a receiver that reports the first fatal
    /// failure it observes
    pub fn new(
        coordinator: Arc<Mutex<Coordinator>>,
        tracker: Arc<ReceiveTracker>,
        resubscriber: Arc<dyn Resubscriber>,
    ) -> (Self, watch::Receiver<Option<FatalReason>>) {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let (usable_tx, _) = watch::channel(false);
        (
            Self {
                coordinator,
                tracker,
                resubscriber,
                fatal_tx,
                usable_tx,
            },
            fatal_rx,
        )
    }

    /// Tracks [`Coordinator::is_usable`] as of the last applied event
    pub fn usable(&self) -> watch::Receiver<bool> {
        self.usable_tx.subscribe()
    }

    async fn refresh_usable(&self) {
        let usable = self.coordinator.lock().await.is_usable();
        self.usable_tx.send_if_modified(|current| {
            let changed = *current != usable;
            *current = usable;
            changed
        });
    }

    /// Apply one event; returns the fatal reason if the session just failed
    pub async fn dispatch(&self, event: TransportEvent) -> Option<FatalReason> {
        let fatal = self.apply(event).await;
        self.refresh_usable().await;
        fatal
    }

    async fn apply(&self, event: TransportEvent) -> Option<FatalReason> {
        let outcome = match event {
            TransportEvent::Connected { session_present } => {
                self.coordinator.lock().await.on_connected(session_present);
                Ok(())
            }
            TransportEvent::Interrupted { reason } => {
                self.coordinator.lock().await.on_interrupted(&reason);
                Ok(())
            }
            TransportEvent::Resumed {
                session_present,
                status,
            } => self.handle_resumed(session_present, &status).await,
            TransportEvent::ResubscribeComplete(grants) => self
                .coordinator
                .lock()
                .await
                .on_resubscribe_complete(&grants),
            TransportEvent::MessageReceived(message) => {
                info!(
                    topic = %message.topic,
                    qos = %message.qos,
                    payload = %message.payload_text(),
                    "Received message"
                );
                self.tracker.record();
                Ok(())
            }
        };

        match outcome {
            Ok(()) => None,
            Err(reason) => {
                error!(reason = %reason, "Stopping event processing");
                self.fatal_tx.send_replace(Some(reason.clone()));
                self.tracker.shutdown();
                Some(reason)
            }
        }
    }

    async fn handle_resumed(
        &self,
        session_present: bool,
        status: &crate::transport::ConnectStatus,
    ) -> Result<(), FatalReason> {
        let mut coordinator = self.coordinator.lock().await;
        match coordinator.on_resumed(session_present, status)? {
            ResumeAction::None => Ok(()),
            ResumeAction::Resubscribe(subscriptions) => {
                debug!(topics = subscriptions.len(), "Issuing resubscribe request");
                match self.resubscriber.request_resubscribe(&subscriptions) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(coordinator.on_resubscribe_request_failed(&e.to_string())),
                }
            }
        }
    }

    /// Consume events until the channel closes or the session fails
    pub async fn run(self, mut events: EventReceiver) {
        self.refresh_usable().await;
        while let Some(event) = events.recv().await {
            if self.dispatch(event).await.is_some() {
                break;
            }
        }
        debug!("Event dispatcher stopped");
    }

    pub fn spawn(self, events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }
}
