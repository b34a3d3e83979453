//! Guest promises and the pending-job queue
//!
//! Reactions never run inline: settling a promise enqueues jobs on the
//! engine's queue, and continuations only fire when the embedder drains
//! it with `execute_pending_jobs`. FIFO order; jobs enqueued during a
//! drain also run within the same drain.

use crate::value::GuestValue;

/// Promise settlement state
#[derive(Clone)]
pub enum PromiseState {
    /// Not yet settled
    Pending,
    /// Resolved with a value
    Fulfilled(GuestValue),
    /// Rejected with a reason
    Rejected(GuestValue),
}

/// A stored `then` reaction
#[derive(Clone)]
pub struct Reaction {
    /// Fulfillment callback
    pub on_fulfilled: Option<GuestValue>,
    /// Rejection callback
    pub on_rejected: Option<GuestValue>,
}

/// Promise payload
pub struct PromiseData {
    /// Current state
    pub state: PromiseState,
    /// Reactions waiting for settlement
    pub reactions: Vec<Reaction>,
}

impl PromiseData {
    /// A fresh pending promise
    pub fn pending() -> Self {
        Self {
            state: PromiseState::Pending,
            reactions: Vec::new(),
        }
    }
}

/// A queued continuation: call `callback(argument)`
pub struct Job {
    /// The guest function to invoke
    pub callback: GuestValue,
    /// Its single argument (the settled value or reason)
    pub argument: GuestValue,
}
