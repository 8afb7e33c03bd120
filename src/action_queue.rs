//! A single-threaded, cooperative work queue.
//!
//! The emulated server (and, in principle, any other component that must
//! serialize asynchronous work against a single socket) enqueues actions
//! here instead of running them inline. An action reports whether it
//! finished on each attempt; the queue retries it on the next scheduling
//! opportunity until it does — the system's only backpressure mechanism.
//! One owner drives the retry loop; callers hand it work and await
//! completion via a oneshot, with the loop's unit of work being "try this
//! closure again" rather than "poll this socket".

use std::collections::VecDeque;

use futures::channel::oneshot;
use log::trace;
use thiserror::Error;

/// An action failed irrecoverably. The queue has no opinion on the error's
/// shape; `String` keeps this module decoupled from any one caller's error
/// type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ActionFailed(pub String);

/// Whether an attempt completed the action or needs to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action is done; remove it from the queue and resolve its reply.
    Complete,
    /// The action made no progress (or isn't ready yet); retry it on the
    /// next scheduling opportunity without advancing the queue.
    Retry,
}

type Action<'a> = Box<dyn FnMut() -> Result<ActionOutcome, ActionFailed> + 'a>;

struct QueuedAction<'a> {
    action: Action<'a>,
    reply: oneshot::Sender<Result<(), ActionFailed>>,
}

/// FIFO queue of actions, driven by repeated calls to [`tick`](Self::tick).
///
/// Only the head of the queue is ever invoked — a later action never starts
/// before an earlier one resolves — and the queue never calls back into
/// itself from inside an action (an action that wants to enqueue more work
/// does so through the same [`ActionQueue`] handle its caller already holds,
/// after `tick` returns).
///
/// Parameterized over a lifetime rather than requiring `'static` actions, so
/// a caller driving a loop on its own stack (the emulated server's
/// connection handler) can hand the queue closures that borrow its local
/// state instead of needing to move everything behind `Rc`/`Arc`.
pub struct ActionQueue<'a> {
    items: VecDeque<QueuedAction<'a>>,
}

impl<'a> Default for ActionQueue<'a> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<'a> std::fmt::Debug for ActionQueue<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("len", &self.items.len())
            .finish()
    }
}

impl<'a> ActionQueue<'a> {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no action is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends `action` to the queue, returning a receiver that resolves
    /// once it completes (or rejects if it fails).
    pub fn run(
        &mut self,
        action: impl FnMut() -> Result<ActionOutcome, ActionFailed> + 'a,
    ) -> oneshot::Receiver<Result<(), ActionFailed>> {
        let (tx, rx) = oneshot::channel();
        self.items.push_back(QueuedAction {
            action: Box::new(action),
            reply: tx,
        });
        rx
    }

    /// Invokes the head action once. If it reports [`ActionOutcome::Complete`],
    /// it's popped and its reply resolved; on [`ActionOutcome::Retry`] it
    /// stays at the head for the next `tick`; on failure it's popped and its
    /// reply rejected. A no-op when the queue is empty.
    ///
    /// Returns whether an action was attempted, so callers driving a poll
    /// loop can decide whether to immediately retry or wait for the next
    /// event.
    pub fn tick(&mut self) -> bool {
        let Some(head) = self.items.front_mut() else {
            return false;
        };

        match (head.action)() {
            Ok(ActionOutcome::Complete) => {
                let item = self.items.pop_front().expect("front_mut just succeeded");
                let _ = item.reply.send(Ok(()));
            }
            Ok(ActionOutcome::Retry) => {
                trace!("action queue: head not yet complete, retrying");
            }
            Err(e) => {
                let item = self.items.pop_front().expect("front_mut just succeeded");
                let _ = item.reply.send(Err(e));
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn retries_until_action_reports_completion() {
        let mut queue = ActionQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let attempts_clone = attempts.clone();
        let mut rx = queue.run(move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n < 3 {
                ActionOutcome::Retry
            } else {
                ActionOutcome::Complete
            })
        });

        assert!(queue.tick());
        assert!(rx.try_recv().unwrap().is_none());
        assert!(queue.tick());
        assert!(rx.try_recv().unwrap().is_none());
        assert!(queue.tick());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(rx.try_recv().unwrap().unwrap().is_ok());
    }

    #[test]
    fn second_action_does_not_start_before_first_resolves() {
        let mut queue = ActionQueue::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        let _first = queue.run(|| Ok(ActionOutcome::Retry));

        let second_ran_clone = second_ran.clone();
        let _second = queue.run(move || {
            second_ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutcome::Complete)
        });

        for _ in 0..5 {
            queue.tick();
        }

        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_action_rejects_its_reply_and_advances_queue() {
        let mut queue = ActionQueue::new();
        let mut rx = queue.run(|| Err(ActionFailed("boom".to_string())));

        queue.tick();
        let err = rx.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err, ActionFailed("boom".to_string()));
        assert!(queue.is_empty());
    }

    #[test]
    fn tick_on_empty_queue_is_a_no_op() {
        let mut queue = ActionQueue::new();
        assert!(!queue.tick());
    }
}
