//! Application flow: connect, subscribe, publish, wait, disconnect
//!
//! The runner owns the transport for the duration of a run. Transport events
//! are consumed by an [`EventDispatcher`] on its own task; the runner only
//! watches the dispatcher's fatal channel and the shutdown handle while it
//! sleeps or waits. Publishing is held whenever the coordinator does not
//! consider the connection usable, which covers the window between a
//! session-less resume and the broker re-granting every subscription.

use crate::config::{PubSubConfig, PublishFailurePolicy};
use crate::error::{PubSubError, PubSubResult};
use crate::lifecycle::{
    Coordinator, EventDispatcher, FatalReason, LifecycleState, ReceiveTracker, Session,
    WaitOutcome,
};
use crate::protocol::{topic_matches, OutboundMessage, QoS};
use crate::transport::Transport;
use crate::{lifecycle_span, mqtt_span};
use bytes::Bytes;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// QoS used for every publish and subscribe the runner issues
const RUN_QOS: QoS = QoS::AtLeastOnce;

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub published: u64,
    pub failed: u64,
    pub received: u64,
    /// The run was stopped through the shutdown handle
    pub cancelled: bool,
    pub state: LifecycleState,
}

/// Cloneable trigger that stops a run at its next wait point
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Why a wait point returned early
enum Interrupt {
    Fatal(FatalReason),
    Shutdown,
}

#[derive(Default)]
struct Counts {
    published: u64,
    failed: u64,
    cancelled: bool,
}

pub struct PubSubRunner<T: Transport> {
    config: PubSubConfig,
    transport: T,
    coordinator: Arc<Mutex<Coordinator>>,
    tracker: Arc<ReceiveTracker>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<T: Transport> PubSubRunner<T> {
    pub fn new(config: PubSubConfig, transport: T) -> Self {
        let coordinator = Coordinator::new(Session::new(config.mqtt.client_id.clone()));
        let tracker = ReceiveTracker::new(Self::expected_messages(&config));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            transport,
            coordinator: Arc::new(Mutex::new(coordinator)),
            tracker: Arc::new(tracker),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Messages that should come back on the subscription
    ///
    /// Zero when not subscribing or when publishing without a count limit.
    pub fn expected_messages(config: &PubSubConfig) -> u64 {
        if !config.publish.subscribe {
            return 0;
        }
        let matching = config
            .publish_targets()
            .iter()
            .filter(|target| topic_matches(&config.publish.topic, target))
            .count() as u64;
        config.publish.count.saturating_mul(matching)
    }

    pub fn coordinator(&self) -> Arc<Mutex<Coordinator>> {
        self.coordinator.clone()
    }

    pub fn tracker(&self) -> Arc<ReceiveTracker> {
        self.tracker.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the whole exchange; the transport is always disconnected before
    /// returning, whatever the outcome
    pub async fn run(&mut self) -> PubSubResult<RunSummary> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.transport.set_event_sender(event_tx);
        let (dispatcher, fatal_rx) = EventDispatcher::new(
            self.coordinator.clone(),
            self.tracker.clone(),
            self.transport.resubscriber(),
        );
        let usable_rx = dispatcher.usable();
        let dispatcher_handle = tokio::spawn(
            dispatcher
                .run(event_rx)
                .instrument(lifecycle_span!(client = %self.log_client_id())),
        );

        let mut counts = Counts::default();
        let outcome = self.exchange(fatal_rx, usable_rx, &mut counts).await;

        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
        self.tracker.shutdown();
        self.coordinator.lock().await.on_shutdown();
        dispatcher_handle.abort();

        let summary = RunSummary {
            published: counts.published,
            failed: counts.failed,
            received: self.tracker.received(),
            cancelled: counts.cancelled,
            state: self.coordinator.lock().await.state().clone(),
        };

        match outcome {
            Ok(()) => {
                info!(
                    published = summary.published,
                    failed = summary.failed,
                    received = summary.received,
                    "Run complete"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "Run failed");
                Err(e)
            }
        }
    }

    fn log_client_id(&self) -> String {
        if self.config.publish.ci_mode {
            "<hidden>".to_string()
        } else {
            self.config.mqtt.client_id.clone()
        }
    }

    async fn exchange(
        &mut self,
        mut fatal_rx: watch::Receiver<Option<FatalReason>>,
        mut usable_rx: watch::Receiver<bool>,
        counts: &mut Counts,
    ) -> PubSubResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if self.config.publish.ci_mode {
            info!("Connecting to broker");
        } else {
            info!(
                endpoint = %self.config.mqtt.endpoint,
                client_id = %self.config.mqtt.client_id,
                "Connecting to broker"
            );
        }
        let session_present = self
            .transport
            .connect()
            .await
            .map_err(PubSubError::connect)?;
        info!(session_present, "Connected");

        if self.config.publish.subscribe {
            self.subscribe_primary_topic().await?;
        }

        self.publish_loop(&mut fatal_rx, &mut shutdown_rx, &mut usable_rx, counts)
            .await?;
        if counts.cancelled {
            return Ok(());
        }

        if self.tracker.target() > 0 {
            self.wait_for_messages(&mut fatal_rx, &mut shutdown_rx, counts)
                .await?;
        }
        Ok(())
    }

    async fn subscribe_primary_topic(&self) -> PubSubResult<()> {
        let topic = self.config.publish.topic.clone();
        info!(topic = %topic, "Subscribing");

        let grant = self
            .transport
            .subscribe(&topic, RUN_QOS)
            .instrument(mqtt_span!(operation = "subscribe", topic = %topic))
            .await
            .map_err(|e| PubSubError::subscribe(topic.clone(), e))?;

        self.coordinator
            .lock()
            .await
            .record_subscription(&topic, RUN_QOS, &grant)
            .map_err(|reason| match reason {
                FatalReason::SubscriptionRejected { topic } => {
                    PubSubError::SubscriptionRejected { topic }
                }
                other => PubSubError::Fatal(other),
            })
    }

    async fn publish_loop(
        &self,
        fatal_rx: &mut watch::Receiver<Option<FatalReason>>,
        shutdown_rx: &mut watch::Receiver<bool>,
        usable_rx: &mut watch::Receiver<bool>,
        counts: &mut Counts,
    ) -> PubSubResult<()> {
        let count = self.config.publish.count;
        let interval = Duration::from_millis(self.config.publish.interval_ms);
        let targets = self.config.publish_targets();
        let template = self.config.message_template();
        let shape = self.config.message.shape;

        let mut sequence = 0u64;
        while count == 0 || sequence < count {
            if let Some(reason) = fatal_rx.borrow().clone() {
                return Err(reason.into());
            }
            let shutting_down = *shutdown_rx.borrow();
            if shutting_down || !self.wait_until_usable(fatal_rx, shutdown_rx, usable_rx).await? {
                counts.cancelled = true;
                return Ok(());
            }
            sequence += 1;

            let payload = Bytes::from(template.build(Local::now()).encode(shape)?);
            for target in &targets {
                let message = OutboundMessage::new(target.clone(), payload.clone(), RUN_QOS);
                let result = self
                    .transport
                    .publish(message)
                    .instrument(mqtt_span!(operation = "publish", topic = %target, sequence))
                    .await;

                match result {
                    Ok(()) => {
                        counts.published += 1;
                        info!(
                            topic = %target,
                            sequence,
                            payload = %String::from_utf8_lossy(&payload),
                            "Published message"
                        );
                    }
                    Err(e) => {
                        counts.failed += 1;
                        warn!(topic = %target, sequence, error = %e, "Publish failed");
                        if self.config.publish.on_publish_error == PublishFailurePolicy::Abort {
                            return Err(PubSubError::publish(target.clone(), e));
                        }
                    }
                }
            }

            let more_to_send = count == 0 || sequence < count;
            if more_to_send && !interval.is_zero() {
                match Self::wait_or_interrupt(fatal_rx, shutdown_rx, tokio::time::sleep(interval))
                    .await
                {
                    Ok(()) => {}
                    Err(Interrupt::Fatal(reason)) => return Err(reason.into()),
                    Err(Interrupt::Shutdown) => {
                        counts.cancelled = true;
                        return Ok(());
                    }
                }
            }
        }

        debug!(messages = sequence, "Publish loop finished");
        Ok(())
    }

    /// Hold until the coordinator reports the connection usable
    ///
    /// Returns `false` when shutdown is requested while holding.
    async fn wait_until_usable(
        &self,
        fatal_rx: &mut watch::Receiver<Option<FatalReason>>,
        shutdown_rx: &mut watch::Receiver<bool>,
        usable_rx: &mut watch::Receiver<bool>,
    ) -> PubSubResult<bool> {
        if *usable_rx.borrow() {
            return Ok(true);
        }

        let state = self.coordinator.lock().await.state().clone();
        info!(state = %state, "Holding publishes until the session is usable");
        let ready = async { usable_rx.wait_for(|usable| *usable).await.map(|_| ()) };

        match Self::wait_or_interrupt(fatal_rx, shutdown_rx, ready).await {
            Ok(Ok(())) => {
                debug!("Session usable, publishing resumes");
                Ok(true)
            }
            // The dispatcher only stops early after reporting a fatal reason
            Ok(Err(_)) => match fatal_rx.borrow().clone() {
                Some(reason) => Err(reason.into()),
                None => Err(PubSubError::internal(
                    "event dispatcher stopped before the session became usable",
                )),
            },
            Err(Interrupt::Fatal(reason)) => Err(reason.into()),
            Err(Interrupt::Shutdown) => Ok(false),
        }
    }

    async fn wait_for_messages(
        &self,
        fatal_rx: &mut watch::Receiver<Option<FatalReason>>,
        shutdown_rx: &mut watch::Receiver<bool>,
        counts: &mut Counts,
    ) -> PubSubResult<()> {
        let timeout = self
            .config
            .publish
            .receive_timeout_secs
            .map(Duration::from_secs);
        info!(
            expected = self.tracker.target(),
            received = self.tracker.received(),
            "Waiting for messages"
        );

        let tracker = self.tracker.clone();
        let outcome =
            Self::wait_or_interrupt(fatal_rx, shutdown_rx, tracker.wait_for_all(timeout)).await;

        match outcome {
            Ok(WaitOutcome::Completed) => Ok(()),
            Ok(WaitOutcome::TimedOut) => Err(PubSubError::ReceiveTimeout {
                received: self.tracker.received(),
                expected: self.tracker.target(),
                timeout: timeout.unwrap_or_default(),
            }),
            // The dispatcher cancels the tracker when the session fails
            Ok(WaitOutcome::Cancelled) => match fatal_rx.borrow().clone() {
                Some(reason) => Err(reason.into()),
                None => {
                    counts.cancelled = true;
                    Ok(())
                }
            },
            Err(Interrupt::Fatal(reason)) => Err(reason.into()),
            Err(Interrupt::Shutdown) => {
                counts.cancelled = true;
                Ok(())
            }
        }
    }

    /// Drive `work` until it finishes, the session fails or shutdown is
    /// requested
    async fn wait_or_interrupt<F>(
        fatal_rx: &mut watch::Receiver<Option<FatalReason>>,
        shutdown_rx: &mut watch::Receiver<bool>,
        work: F,
    ) -> Result<F::Output, Interrupt>
    where
        F: std::future::Future,
    {
        tokio::pin!(work);
        let mut fatal_open = true;
        let mut shutdown_open = true;
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                changed = fatal_rx.changed(), if fatal_open => {
                    if changed.is_err() {
                        fatal_open = false;
                    } else if let Some(reason) = fatal_rx.borrow_and_update().clone() {
                        return Err(Interrupt::Fatal(reason));
                    }
                }
                changed = shutdown_rx.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    } else if *shutdown_rx.borrow_and_update() {
                        info!("Shutdown requested");
                        return Err(Interrupt::Shutdown);
                    }
                }
            }
        }
    }
}
