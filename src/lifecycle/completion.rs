//! Completion signalling for the receive side
//!
//! The message-received path counts deliveries and fires a one-shot signal
//! once the expected number has arrived. The main flow waits on that signal
//! instead of polling a counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Set,
    Cancelled,
}

/// How a wait on a [`CompletionSignal`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

/// One-shot signal shared between the event path and the main flow
///
/// Setting it more than once has no additional effect, and once cancelled it
/// can no longer be set.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    state: Arc<watch::Sender<SignalState>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SignalState::Pending);
        Self {
            state: Arc::new(state),
        }
    }

    /// Fire the signal; returns true only for the call that fired it
    pub fn set(&self) -> bool {
        self.transition_from_pending(SignalState::Set)
    }

    /// Release any waiter without completing, used on shutdown
    pub fn cancel(&self) -> bool {
        self.transition_from_pending(SignalState::Cancelled)
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow() == SignalState::Set
    }

    /// Wait for the signal, bounded by `timeout` when given
    pub async fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut rx = self.state.subscribe();
        let settled = async move {
            match rx.wait_for(|state| *state != SignalState::Pending).await {
                Ok(state) if *state == SignalState::Set => WaitOutcome::Completed,
                _ => WaitOutcome::Cancelled,
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, settled)
                .await
                .unwrap_or(WaitOutcome::TimedOut),
            None => settled.await,
        }
    }

    fn transition_from_pending(&self, next: SignalState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SignalState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Counts received messages and completes once the target is reached
#[derive(Debug)]
pub struct ReceiveTracker {
    received: AtomicU64,
    target: u64,
    signal: CompletionSignal,
}

impl ReceiveTracker {
    /// A target of zero never fires; there is nothing to wait for
    pub fn new(target: u64) -> Self {
        Self {
            received: AtomicU64::new(0),
            target,
            signal: CompletionSignal::new(),
        }
    }

    /// Count one delivery, returning the new total
    pub fn record(&self) -> u64 {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(received = count, target = self.target, "Message counted");
        if self.target > 0 && count == self.target && self.signal.set() {
            info!(received = count, "All expected messages received");
        }
        count
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_set()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    /// With a zero target this only returns on timeout or [`shutdown`](Self::shutdown)
    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.signal.wait(timeout).await
    }

    /// Unblock any waiter during shutdown
    pub fn shutdown(&self) {
        self.signal.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_sets_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }

    #[test]
    fn test_cancelled_signal_cannot_be_set() {
        let signal = CompletionSignal::new();
        assert!(signal.cancel());
        assert!(!signal.set());
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn test_wait_returns_after_set() {
        let signal = CompletionSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait(None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();

        assert_eq!(handle.await.unwrap(), WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn test_wait_after_set_returns_immediately() {
        let signal = CompletionSignal::new();
        signal.set();
        assert_eq!(
            signal.wait(Some(Duration::from_millis(10))).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let signal = CompletionSignal::new();
        assert_eq!(
            signal.wait(Some(Duration::from_millis(20))).await,
            WaitOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let signal = CompletionSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait(None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        assert_eq!(handle.await.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_tracker_fires_on_target() {
        let tracker = Arc::new(ReceiveTracker::new(3));
        assert_eq!(tracker.record(), 1);
        assert_eq!(tracker.record(), 2);
        assert!(!tracker.is_complete());
        assert_eq!(tracker.record(), 3);
        assert!(tracker.is_complete());

        // Extra deliveries are counted but do not re-fire
        assert_eq!(tracker.record(), 4);
        assert_eq!(
            tracker.wait_for_all(Some(Duration::from_millis(10))).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_tracker_with_zero_target_never_fires() {
        let tracker = Arc::new(ReceiveTracker::new(0));
        tracker.record();
        tracker.record();
        assert!(!tracker.is_complete());
        assert_eq!(
            tracker.wait_for_all(Some(Duration::from_millis(20))).await,
            WaitOutcome::TimedOut
        );

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_all(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.shutdown();
        assert_eq!(handle.await.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_every_waiter_sees_completion() {
        let tracker = Arc::new(ReceiveTracker::new(2));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                async move { tracker.wait_for_all(Some(Duration::from_secs(1))).await }
            })
            .collect();

        tracker.record();
        tracker.record();

        let outcomes = futures::future::join_all(waiters).await;
        assert!(outcomes.iter().all(|o| *o == WaitOutcome::Completed));
    }

    #[tokio::test]
    async fn test_tracker_concurrent_records() {
        let tracker = Arc::new(ReceiveTracker::new(50));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.received(), 50);
        assert_eq!(
            tracker.wait_for_all(Some(Duration::from_secs(1))).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_tracker_shutdown_unblocks() {
        let tracker = ReceiveTracker::new(5);
        tracker.record();
        tracker.shutdown();
        assert_eq!(tracker.wait_for_all(None).await, WaitOutcome::Cancelled);
    }
}
