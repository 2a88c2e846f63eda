//! Mailboxes: the FIFO + execution binding that schedules a server's work.
//!
//! A mailbox sequences *work items* for exactly one server. Each item is a
//! boxed job prepared by the server (message dispatch, state update, reply
//! routing); the mailbox's contract is purely about ordering and execution:
//!
//! - Jobs run in strict FIFO order of enqueue time.
//! - At most one job per mailbox runs at any instant.
//! - A reply-required submission blocks the caller until its job has run and
//!   hands back the job's verdict (synchronous rendezvous).
//! - A fire-and-forget submission returns immediately once enqueued.
//!
//! Two backends implement the contract: [`ThreadedMailbox`] owns a dedicated
//! worker thread, [`DispatchedMailbox`] multiplexes onto a shared
//! [`Dispatcher`](crate::dispatcher::Dispatcher) while still guaranteeing the
//! single-consumer discipline.
//!
//! # Capacity
//!
//! A capacity of `0` means unbounded. On a bounded mailbox at capacity, a
//! fire-and-forget submission fails with [`Submission::Full`], while a
//! reply-required submission blocks until space frees up (or the mailbox
//! stops). Capacity bounds *queued* items; the item currently running does
//! not count.
//!
//! # Stop
//!
//! [`Mailbox::stop`] causes later submissions to yield
//! [`Submission::Stopped`], discards queued-but-unstarted items (waking any
//! blocked reply-required submitters with `Stopped`), and releases the
//! execution context.

mod dispatched;
mod threaded;

pub use dispatched::DispatchedMailbox;
pub use threaded::ThreadedMailbox;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};

use tracing::warn;

/// A unit of work prepared by the server for its mailbox.
///
/// The job returns `Some(verdict)` when the work item owes a verdict to a
/// blocked reply-required submitter, and `None` when the verdict was routed
/// elsewhere (async-call reply path) or discarded (plain cast).
pub type Job<T> = Box<dyn FnOnce() -> Option<T> + Send + 'static>;

/// Outcome of [`Mailbox::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Submission<T> {
    /// Reply-required rendezvous: the job ran and produced this verdict.
    Completed(T),
    /// Fire-and-forget: the item was accepted and will run later.
    Enqueued,
    /// The mailbox has stopped; the item was not accepted (or was discarded
    /// before it could run).
    Stopped,
    /// The mailbox is bounded and at capacity.
    Full,
}

/// Sequences work items for one server.
pub trait Mailbox<T: Send + 'static>: Send + Sync {
    /// Submits a job.
    ///
    /// With `reply_required` the caller blocks until the job has run and
    /// receives [`Submission::Completed`] (or [`Submission::Stopped`] if the
    /// mailbox stops first). Without it, the job is enqueued and
    /// [`Submission::Enqueued`] comes back immediately.
    fn submit(&self, job: Job<T>, reply_required: bool) -> Submission<T>;

    /// Stops the mailbox: rejects later submissions, discards queued items,
    /// releases the execution context. Idempotent.
    fn stop(&self);

    /// Number of queued (not yet started) items.
    fn len(&self) -> usize;

    /// `true` when no items are queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once the mailbox has stopped.
    fn is_stopped(&self) -> bool;

    /// Configured capacity; `0` means unbounded.
    fn capacity(&self) -> usize;
}

/// A queued work item: the job plus the rendezvous cell for a blocked
/// reply-required submitter.
pub(crate) struct Slot<T: Send + 'static> {
    pub(crate) job: Job<T>,
    pub(crate) completion: Option<std::sync::Arc<Completion<T>>>,
}

/// Runs one slot on the current thread and resolves its completion.
///
/// Jobs trap handler panics internally; a panic escaping the job itself is a
/// runtime bug, logged and converted into a discarded completion so a blocked
/// submitter is not stranded.
pub(crate) fn run_slot<T: Send + 'static>(slot: Slot<T>, label: &str) {
    let Slot { job, completion } = slot;
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Some(verdict)) => {
            if let Some(completion) = completion {
                completion.complete(verdict);
            }
        }
        Ok(None) => {
            if let Some(completion) = completion {
                completion.discard();
            }
        }
        Err(_) => {
            warn!(mailbox = %label, "work item panicked outside the handler trap");
            if let Some(completion) = completion {
                completion.discard();
            }
        }
    }
}

enum CompletionState<T> {
    Pending,
    Done(T),
    Discarded,
}

/// Per-submission completion signal for reply-required rendezvous.
pub(crate) struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    condvar: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::Pending),
            condvar: Condvar::new(),
        }
    }

    /// Hands the verdict to the blocked submitter.
    pub(crate) fn complete(&self, verdict: T) {
        let mut state = self.state.lock().expect("completion lock poisoned");
        if matches!(*state, CompletionState::Pending) {
            *state = CompletionState::Done(verdict);
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Wakes the blocked submitter without a verdict (item discarded).
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock().expect("completion lock poisoned");
        if matches!(*state, CompletionState::Pending) {
            *state = CompletionState::Discarded;
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Blocks until resolved. `None` means the item was discarded.
    pub(crate) fn wait(&self) -> Option<T> {
        let mut state = self.state.lock().expect("completion lock poisoned");
        loop {
            match std::mem::replace(&mut *state, CompletionState::Pending) {
                CompletionState::Done(verdict) => return Some(verdict),
                CompletionState::Discarded => return None,
                CompletionState::Pending => {
                    state = self.condvar.wait(state).expect("completion lock poisoned");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn completion_rendezvous_across_threads() {
        let completion = Arc::new(Completion::new());
        let signal = Arc::clone(&completion);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.complete(42);
        });
        assert_eq!(completion.wait(), Some(42));
    }

    #[test]
    fn discarded_completion_wakes_with_none() {
        let completion: Arc<Completion<u32>> = Arc::new(Completion::new());
        let signal = Arc::clone(&completion);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.discard();
        });
        assert_eq!(completion.wait(), None);
    }

    #[test]
    fn run_slot_resolves_completion_with_job_verdict() {
        let completion = Arc::new(Completion::new());
        let slot = Slot {
            job: Box::new(|| Some(5)),
            completion: Some(Arc::clone(&completion)),
        };
        run_slot(slot, "test");
        assert_eq!(completion.wait(), Some(5));
    }

    #[test]
    fn run_slot_discards_completion_when_job_panics() {
        let completion: Arc<Completion<u32>> = Arc::new(Completion::new());
        let slot = Slot {
            job: Box::new(|| panic!("boom")),
            completion: Some(Arc::clone(&completion)),
        };
        run_slot(slot, "test");
        assert_eq!(completion.wait(), None);
    }
}
