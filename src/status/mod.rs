//! Status polling state machine.
//!
//! `Polling → {Complete+Healthy, Complete+Unhealthy, TimedOut}`: fetch the
//! live status, stop once the kind's completion predicate holds, otherwise
//! rest and retry until the budget runs out.

mod manager;
mod poll;
mod resource_status;

pub use manager::{Completion, CompletionHook, StatusManager};
pub use poll::{poll_until, Poll, PollOutcome};
pub use resource_status::ResourceStatus;
