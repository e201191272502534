//! rumqttc-backed MQTT client and its event loop task
//!
//! This module handles all impure I/O operations including network
//! communication, async coordination, and integration with the rumqttc
//! client. rumqttc reconnects on the next poll after an error using the same
//! client id and session, so the event loop task only decides how long to
//! back off and what to report.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::event_router::{EventRoute, EventRouter};
use super::health_monitor::{ConnectionEvent, HealthMonitor, RetryDecision};
use super::requests::{PendingSubscribe, RequestKind, SubscribeRequests};
use crate::config::MqttSection;
use crate::lifecycle::{Grant, Subscription};
use crate::protocol::{validate_topic_filter, validate_topic_name, OutboundMessage, QoS};
use crate::transport::{ConnectStatus, EventSender, Resubscriber, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the event loop to flush DISCONNECT
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT transport client
pub struct MqttClient {
    config: MqttSection,
    client: AsyncClient,
    /// Held until `connect` moves it into the event loop task. `EventLoop`
    /// is not `Sync`, the mutex makes the client shareable.
    event_loop: Option<Mutex<EventLoop>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    requests: Arc<SubscribeRequests>,
    events: Option<EventSender>,
    closing: Arc<AtomicBool>,
    session_present: Arc<AtomicBool>,
    subscribe_timeout: Duration,
}

impl MqttClient {
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let subscribe_timeout = Duration::from_secs(config.connect_timeout_secs);

        Ok(MqttClient {
            config,
            client,
            event_loop: Some(Mutex::new(event_loop)),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            requests: Arc::new(SubscribeRequests::new()),
            events: None,
            closing: Arc::new(AtomicBool::new(false)),
            session_present: Arc::new(AtomicBool::new(false)),
            subscribe_timeout,
        })
    }

    pub fn with_reconnect_config(
        mut self,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        HealthMonitor::validate_reconnect_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;
        self.reconnect_config = reconnect_config;
        Ok(self)
    }

    /// State starts at `Connecting`, shutdown at `false`
    #[allow(clippy::type_complexity)]
    fn state_and_shutdown_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Resolve once the event loop reports a CONNACK, or fail on refusal or timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionRefused(reason.clone()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::Timeout(timeout)),
        }
    }

    /// Backoff sleep that ends early on shutdown; `false` means stop polling
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Client closing during backoff, event loop stops");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Connect and wait for the broker's CONNACK
    ///
    /// Returns the broker's session-present flag. A failed initial connect
    /// is not retried.
    pub async fn connect(&mut self) -> Result<bool, MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| MqttError::ConnectionFailedStr("Event loop already started".to_string()))?
            .into_inner();

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::state_and_shutdown_channels();
        self.state_rx = Some(state_rx.clone());

        let task = EventLoopTask {
            event_loop,
            state_tx,
            shutdown_rx,
            requests: self.requests.clone(),
            events: self.events.clone(),
            reconnect_config: self.reconnect_config.clone(),
            closing: self.closing.clone(),
            session_present: self.session_present.clone(),
            has_connected: false,
            interrupted: false,
            reconnect_attempts: 0,
        };
        self.event_loop_handle = Some(tokio::spawn(task.run()));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, timeout).await {
            let _ = shutdown_tx.send(true);
            self.shutdown_tx = Some(shutdown_tx);
            return Err(e);
        }
        self.shutdown_tx = Some(shutdown_tx);

        Ok(self.session_present.load(Ordering::SeqCst))
    }

    /// Send DISCONNECT and stop the event loop
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let Some(handle) = self.event_loop_handle.take() else {
            debug!("Disconnect requested before connect");
            return Ok(());
        };

        self.closing.store(true, Ordering::SeqCst);
        let abandoned = self.requests.pending();
        if abandoned > 0 {
            warn!(abandoned, "Disconnecting with subscribe requests still awaiting SUBACK");
        }

        let was_connected = self.is_connected();
        if was_connected {
            if let Err(e) = self.client.try_disconnect() {
                warn!(error = %e, "Failed to queue DISCONNECT");
            }
        }

        let mut handle = handle;
        if was_connected {
            match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing stop"),
            }
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if !handle.is_finished() {
            handle.abort();
        }

        info!("MQTT client disconnected");
        Ok(())
    }

    /// `None` before [`MqttClient::connect`] starts the event loop
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn check_connection_state(
        &self,
        allowed: fn(&ConnectionState) -> bool,
    ) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !allowed(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Subscribe to one topic filter and wait for its SUBACK
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<Grant, MqttError> {
        validate_topic_filter(topic).map_err(MqttError::InvalidTopic)?;
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        let (responder, grant_rx) = oneshot::channel();
        let pending = PendingSubscribe {
            topics: vec![Subscription::new(topic, qos)],
            kind: RequestKind::Subscribe { responder },
        };
        self.requests
            .submit(&self.client, pending)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        debug!(topic = %topic, qos = %qos, "Subscribe requested");

        let grants = tokio::time::timeout(self.subscribe_timeout, grant_rx)
            .await
            .map_err(|_| MqttError::Timeout(self.subscribe_timeout))?
            .map_err(|_| {
                MqttError::SubscriptionFailed(
                    format!("connection lost before SUBACK for {topic}").into(),
                )
            })?;

        grants.into_iter().next().ok_or_else(|| {
            MqttError::SubscriptionFailed(format!("empty SUBACK for {topic}").into())
        })
    }

    pub async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError> {
        validate_topic_name(&message.topic).map_err(MqttError::InvalidTopic)?;
        self.check_connection_state(HealthMonitor::can_publish)?;

        self.client
            .publish(
                message.topic.clone(),
                message.qos.into(),
                message.retain,
                message.payload,
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic = %message.topic, qos = %message.qos, "Published message");
        Ok(())
    }

    /// Handle for issuing resubscribe requests from the event path
    pub fn resubscriber(&self) -> Arc<dyn Resubscriber> {
        Arc::new(MqttResubscriber {
            client: self.client.clone(),
            requests: self.requests.clone(),
        })
    }
}

/// Issues lifecycle resubscribes on the live client without blocking
struct MqttResubscriber {
    client: AsyncClient,
    requests: Arc<SubscribeRequests>,
}

impl Resubscriber for MqttResubscriber {
    fn request_resubscribe(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let pending = PendingSubscribe {
            topics: subscriptions.to_vec(),
            kind: RequestKind::Resubscribe,
        };
        self.requests.submit(&self.client, pending)?;
        Ok(())
    }
}

/// State owned by the spawned event loop task
struct EventLoopTask {
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    requests: Arc<SubscribeRequests>,
    events: Option<EventSender>,
    reconnect_config: ReconnectConfig,
    closing: Arc<AtomicBool>,
    session_present: Arc<AtomicBool>,
    has_connected: bool,
    interrupted: bool,
    reconnect_attempts: u32,
}

impl EventLoopTask {
    async fn run(mut self) {
        info!("Starting MQTT event loop");
        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                    continue;
                }
                polled = self.event_loop.poll() => polled,
            };

            let keep_going = match polled {
                Ok(event) => self.handle_route(EventRouter::route(&event)),
                Err(e) => self.handle_error(e).await,
            };
            if !keep_going {
                break;
            }
        }
        info!("MQTT event loop stopped");
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Event receiver dropped, discarding transport event");
            }
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    /// Returns false when the loop should stop
    fn handle_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged {
                session_present,
                status: ConnectStatus::Accepted,
            } => {
                self.session_present.store(session_present, Ordering::SeqCst);
                self.reconnect_attempts = 0;
                self.interrupted = false;
                self.transition(ConnectionEvent::ConnAckReceived);

                let event = if self.has_connected {
                    TransportEvent::Resumed {
                        session_present,
                        status: ConnectStatus::Accepted,
                    }
                } else {
                    TransportEvent::Connected { session_present }
                };
                self.has_connected = true;
                self.emit(event);
                true
            }
            EventRoute::ConnectionAcknowledged {
                status: ConnectStatus::Refused(code),
                ..
            } => self.refused(code),
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", topic = %message.topic, "Received MQTT message");
                self.emit(TransportEvent::MessageReceived(message));
                true
            }
            EventRoute::Disconnected => {
                // The next poll errors and takes the interruption path
                warn!("Broker sent DISCONNECT");
                self.transition(ConnectionEvent::DisconnectedByBroker);
                true
            }
            EventRoute::SubscriptionAcknowledged { packet_id, grants } => {
                if let Some(grants) = self.requests.complete(packet_id, &grants) {
                    self.emit(TransportEvent::ResubscribeComplete(grants));
                }
                true
            }
            EventRoute::SubscribeSent { packet_id } => {
                self.requests.assign_packet_id(packet_id);
                true
            }
            EventRoute::DisconnectSent => {
                info!("DISCONNECT sent to broker");
                self.state_tx
                    .send_replace(ConnectionState::Disconnected("Client disconnected".to_string()));
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn refused(&mut self, code: String) -> bool {
        error!(code = %code, "Broker refused connection");
        if self.has_connected {
            self.emit(TransportEvent::Resumed {
                session_present: false,
                status: ConnectStatus::Refused(code.clone()),
            });
        }
        self.transition(ConnectionEvent::PermanentFailure(format!(
            "Broker refused connection: {code}"
        )));
        false
    }

    /// Returns false when the loop should stop
    async fn handle_error(&mut self, error: ConnectionError) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            debug!(error = %error, "Event loop error while closing");
            return false;
        }

        if let ConnectionError::ConnectionRefused(code) = &error {
            return self.refused(format!("{code:?}"));
        }

        let reason = error.to_string();
        if !self.has_connected {
            error!(error = %reason, "Initial MQTT connection failed");
            self.transition(ConnectionEvent::NetworkError(reason));
            return false;
        }

        if !self.interrupted {
            self.interrupted = true;
            let dropped = self.requests.fail_in_flight();
            if dropped > 0 {
                debug!(dropped, "Dropped subscribe requests awaiting SUBACK");
            }
            self.emit(TransportEvent::Interrupted {
                reason: reason.clone(),
            });
        }
        self.transition(ConnectionEvent::NetworkError(reason));

        let decision = HealthMonitor::next_retry(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );
        match decision {
            RetryDecision::Retry { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                MqttClient::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await
            }
            RetryDecision::ShuttingDown => false,
            RetryDecision::GiveUp => {
                self.transition(ConnectionEvent::PermanentFailure(format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                )));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<bool, Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<Grant, Self::Error> {
        MqttClient::subscribe(self, topic, qos).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), Self::Error> {
        MqttClient::publish(self, message).await
    }

    fn resubscriber(&self) -> Arc<dyn Resubscriber> {
        MqttClient::resubscriber(self)
    }

    fn set_event_sender(&mut self, sender: EventSender) {
        self.events = Some(sender);
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Drop cannot await; callers wanting a clean DISCONNECT call disconnect()
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
