//! Session lifecycle: subscription bookkeeping, the interruption/resumption
//! state machine, and the event path that drives it.

pub mod completion;
pub mod coordinator;
pub mod dispatcher;
pub mod session;

pub use completion::{CompletionSignal, ReceiveTracker, WaitOutcome};
pub use coordinator::{Coordinator, FatalReason, LifecycleState, ResumeAction};
pub use dispatcher::EventDispatcher;
pub use session::{Grant, Session, Subscription};
