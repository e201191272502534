//! Connection lifecycle coordinator
//!
//! Pure state machine that reacts to interruption and resumption signals from
//! the transport. When a connection resumes without the broker having kept
//! the session, every recorded subscription must be re-established before the
//! connection counts as usable again.
//!
//! Nothing here blocks or performs I/O. `on_resumed` only *returns* the
//! resubscribe request; the caller issues it and later feeds the broker's
//! answer back through `on_resubscribe_complete`.

use super::session::{Grant, Session, Subscription};
use crate::protocol::QoS;
use crate::transport::ConnectStatus;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Lifecycle states of the logical session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// No usable connection; initial state and normal terminal state
    Disconnected,
    /// Initial connect succeeded
    ConnectedSessionUnknown,
    /// Resumed and the broker kept the session, so prior grants still hold
    ConnectedSessionPersisted,
    /// Resumed without a session; waiting for resubscribe grants
    ConnectedResubscribing,
    /// Every subscription has been re-granted
    ConnectedReady,
    /// Terminal failure, no further processing for this session
    Fatal(FatalReason),
}

impl LifecycleState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            LifecycleState::ConnectedSessionUnknown
                | LifecycleState::ConnectedSessionPersisted
                | LifecycleState::ConnectedResubscribing
                | LifecycleState::ConnectedReady
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LifecycleState::Fatal(_))
    }

    /// Short name for structured log fields
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::ConnectedSessionUnknown => "connected_session_unknown",
            LifecycleState::ConnectedSessionPersisted => "connected_session_persisted",
            LifecycleState::ConnectedResubscribing => "connected_resubscribing",
            LifecycleState::ConnectedReady => "connected_ready",
            LifecycleState::Fatal(_) => "fatal",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Fatal(reason) => write!(f, "fatal ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Why the session can no longer continue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalReason {
    #[error("server rejected subscription to topic: {topic}")]
    SubscriptionRejected { topic: String },

    #[error("broker rejected the resumed connection: {status}")]
    ConnectionRejected { status: String },

    #[error("could not request resubscription to topic {topic}: {reason}")]
    ResubscribeRequestFailed { topic: String, reason: String },
}

impl FatalReason {
    /// Topic the failure is attributed to, if any
    pub fn topic(&self) -> Option<&str> {
        match self {
            FatalReason::SubscriptionRejected { topic }
            | FatalReason::ResubscribeRequestFailed { topic, .. } => Some(topic),
            FatalReason::ConnectionRejected { .. } => None,
        }
    }
}

/// What the caller must do after a resume signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Nothing to do
    None,
    /// Re-issue exactly these subscriptions in one request
    Resubscribe(Vec<Subscription>),
}

/// Owns the session and drives its lifecycle state
#[derive(Debug)]
pub struct Coordinator {
    session: Session,
    state: LifecycleState,
    last_interruption: Option<String>,
    interruptions: u32,
    resubscribe_requests: u32,
}

impl Coordinator {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: LifecycleState::Disconnected,
            last_interruption: None,
            interruptions: 0,
            resubscribe_requests: 0,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Reason given for the most recent interruption
    pub fn last_interruption(&self) -> Option<&str> {
        self.last_interruption.as_deref()
    }

    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    /// Number of resubscribe requests issued so far
    pub fn resubscribe_requests(&self) -> u32 {
        self.resubscribe_requests
    }

    pub fn fatal_reason(&self) -> Option<&FatalReason> {
        match &self.state {
            LifecycleState::Fatal(reason) => Some(reason),
            _ => None,
        }
    }

    /// Connected and not waiting on resubscription
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::ConnectedSessionUnknown
                | LifecycleState::ConnectedSessionPersisted
                | LifecycleState::ConnectedReady
        )
    }

    /// Initial connect acknowledged by the broker
    pub fn on_connected(&mut self, session_present: bool) {
        if self.halted("connected") {
            return;
        }

        self.session.set_session_present(session_present);
        if self.state == LifecycleState::Disconnected {
            self.transition(LifecycleState::ConnectedSessionUnknown);
        } else {
            debug!(state = %self.state, "Connect signal while already connected");
        }
        info!(
            client_id = %self.session.client_id(),
            session_present,
            "Connected to broker"
        );
    }

    /// Record the outcome of an application-issued subscribe
    pub fn record_subscription(
        &mut self,
        topic: &str,
        requested: QoS,
        grant: &Grant,
    ) -> Result<(), FatalReason> {
        if let Some(reason) = self.fatal_reason() {
            return Err(reason.clone());
        }

        self.session.record_request(topic, requested);
        match grant.qos {
            Some(qos) => {
                self.session.apply_grant(grant);
                info!(topic = %topic, requested = %requested, granted = %qos, "Subscribed");
                Ok(())
            }
            None => {
                self.session.apply_grant(grant);
                Err(self.fail(FatalReason::SubscriptionRejected {
                    topic: topic.to_string(),
                }))
            }
        }
    }

    /// Transport lost the connection; must stay cheap since it runs on the
    /// transport's delivery context
    pub fn on_interrupted(&mut self, error_info: &str) {
        if self.halted("interrupted") {
            return;
        }

        self.interruptions += 1;
        self.last_interruption = Some(error_info.to_string());
        warn!(error = %error_info, "Connection interrupted");
        self.transition(LifecycleState::Disconnected);
    }

    /// Transport re-established the connection
    ///
    /// A broker rejection is fatal. An accepted resume without a session and
    /// with recorded subscriptions yields a single resubscribe request that
    /// carries each topic's originally requested QoS.
    pub fn on_resumed(
        &mut self,
        session_present: bool,
        status: &ConnectStatus,
    ) -> Result<ResumeAction, FatalReason> {
        if self.halted("resumed") {
            return Ok(ResumeAction::None);
        }

        info!(status = %status, session_present, "Connection resumed");

        if let ConnectStatus::Refused(code) = status {
            return Err(self.fail(FatalReason::ConnectionRejected {
                status: code.clone(),
            }));
        }

        if self.state != LifecycleState::Disconnected {
            warn!(state = %self.state, "Resume signal without a prior interruption");
        }

        self.session.set_session_present(session_present);

        if session_present {
            self.transition(LifecycleState::ConnectedSessionPersisted);
            return Ok(ResumeAction::None);
        }

        if !self.session.has_subscriptions() {
            self.transition(LifecycleState::ConnectedReady);
            return Ok(ResumeAction::None);
        }

        let subscriptions = self.session.resubscribe_set();
        self.resubscribe_requests += 1;
        info!(
            topics = subscriptions.len(),
            "Session did not persist, resubscribing to existing topics"
        );
        self.transition(LifecycleState::ConnectedResubscribing);
        Ok(ResumeAction::Resubscribe(subscriptions))
    }

    /// Broker answered a resubscribe request
    ///
    /// Any rejected topic is fatal. Grants arriving outside of
    /// `ConnectedResubscribing` (a stale answer after another interruption)
    /// are still recorded but do not change the state.
    pub fn on_resubscribe_complete(&mut self, grants: &[Grant]) -> Result<(), FatalReason> {
        if let Some(reason) = self.fatal_reason() {
            return Err(reason.clone());
        }

        info!(?grants, "Resubscribe results");

        if let Some(rejected) = grants.iter().find(|g| g.is_rejected()) {
            return Err(self.fail(FatalReason::SubscriptionRejected {
                topic: rejected.topic.clone(),
            }));
        }

        for grant in grants {
            if !self.session.apply_grant(grant) {
                debug!(topic = %grant.topic, "Grant for a topic the session does not track");
            }
        }

        if self.state == LifecycleState::ConnectedResubscribing {
            self.transition(LifecycleState::ConnectedReady);
        } else {
            debug!(state = %self.state, "Resubscribe results arrived outside of resubscribing");
        }
        Ok(())
    }

    /// The resubscribe request could not even be handed to the transport
    pub fn on_resubscribe_request_failed(&mut self, reason: &str) -> FatalReason {
        if let Some(existing) = self.fatal_reason() {
            return existing.clone();
        }

        let topic = self
            .session
            .subscriptions()
            .next()
            .map(|s| s.topic.clone())
            .unwrap_or_default();
        self.fail(FatalReason::ResubscribeRequestFailed {
            topic,
            reason: reason.to_string(),
        })
    }

    /// Deliberate disconnect; session state is discarded
    pub fn on_shutdown(&mut self) {
        if self.state.is_fatal() {
            return;
        }
        self.session.clear();
        self.transition(LifecycleState::Disconnected);
    }

    fn fail(&mut self, reason: FatalReason) -> FatalReason {
        error!(reason = %reason, "Session failed");
        self.transition(LifecycleState::Fatal(reason.clone()));
        reason
    }

    fn halted(&self, signal: &str) -> bool {
        if self.state.is_fatal() {
            debug!(signal, "Ignoring signal after fatal failure");
            return true;
        }
        false
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            info!(from = self.state.name(), to = next.name(), "Lifecycle transition");
        }
        self.state = next;
    }
}
