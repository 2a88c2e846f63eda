//! Mailbox multiplexed onto a shared dispatcher pool.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, trace, warn};

use super::{run_slot, Completion, Job, Mailbox, Slot, Submission};
use crate::dispatcher::DispatcherHandle;

struct QueueState<T: Send + 'static> {
    queue: VecDeque<Slot<T>>,
    stopped: bool,
    /// `true` while a drain task for this mailbox is scheduled or running.
    in_flight: bool,
}

struct Shared<T: Send + 'static> {
    label: String,
    /// `0` means unbounded.
    capacity: usize,
    dispatcher: DispatcherHandle,
    state: Mutex<QueueState<T>>,
    /// Signalled when a drain pops an item off a bounded queue.
    space_ready: Condvar,
}

/// A [`Mailbox`] whose items run on a shared [`Dispatcher`] pool.
///
/// No dedicated worker: a submission schedules a *drain task* onto the
/// dispatcher only when none is in flight for this mailbox, and the drain
/// task runs queued items one at a time until the queue is empty. The
/// `in_flight` flag lives under the queue lock, so a racing submission
/// either finds work still queued or schedules a fresh drain; at most one
/// drain per mailbox ever runs, preserving the single-consumer discipline.
///
/// Enqueue under the queue lock is the FIFO linearization point for
/// cross-thread submissions.
///
/// The dispatcher must outlive every mailbox bound to it; it is shared state
/// owned by the system, not by this mailbox.
///
/// [`Dispatcher`]: crate::dispatcher::Dispatcher
pub struct DispatchedMailbox<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> DispatchedMailbox<T> {
    /// Creates the mailbox bound to `dispatcher`.
    ///
    /// `label` names the mailbox in logs; `capacity` of `0` means unbounded.
    #[must_use]
    pub fn new(label: &str, capacity: usize, dispatcher: DispatcherHandle) -> Self {
        let shared = Arc::new(Shared {
            label: label.to_string(),
            capacity,
            dispatcher,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                stopped: false,
                in_flight: false,
            }),
            space_ready: Condvar::new(),
        });
        debug!(mailbox = %label, capacity, "dispatched mailbox started");
        Self { shared }
    }

    /// Schedules a drain task if none is in flight. Must be called with the
    /// queue lock held; the flag is cleared by the drain itself.
    fn schedule_drain(shared: &Arc<Shared<T>>, state: &mut QueueState<T>) {
        if state.in_flight || state.queue.is_empty() {
            return;
        }
        state.in_flight = true;
        let drain_target = Arc::clone(shared);
        shared.dispatcher.dispatch(move || drain(&drain_target));
    }
}

fn drain<T: Send + 'static>(shared: &Arc<Shared<T>>) {
    loop {
        let slot = {
            let mut state = shared.state.lock().expect("mailbox lock poisoned");
            match state.queue.pop_front() {
                Some(slot) => slot,
                None => {
                    state.in_flight = false;
                    return;
                }
            }
        };
        shared.space_ready.notify_one();
        trace!(mailbox = %shared.label, "draining work item");
        run_slot(slot, &shared.label);
    }
}

impl<T: Send + 'static> Mailbox<T> for DispatchedMailbox<T> {
    fn submit(&self, job: Job<T>, reply_required: bool) -> Submission<T> {
        let mut state = self.shared.state.lock().expect("mailbox lock poisoned");
        if state.stopped {
            return Submission::Stopped;
        }

        if self.shared.capacity != 0 && state.queue.len() >= self.shared.capacity {
            if !reply_required {
                trace!(mailbox = %self.shared.label, "bounded mailbox full; rejecting cast");
                return Submission::Full;
            }
            while state.queue.len() >= self.shared.capacity && !state.stopped {
                state = self
                    .shared
                    .space_ready
                    .wait(state)
                    .expect("mailbox lock poisoned");
            }
            if state.stopped {
                return Submission::Stopped;
            }
        }

        if reply_required {
            let completion = Arc::new(Completion::new());
            state.queue.push_back(Slot {
                job,
                completion: Some(Arc::clone(&completion)),
            });
            Self::schedule_drain(&self.shared, &mut state);
            drop(state);
            match completion.wait() {
                Some(verdict) => Submission::Completed(verdict),
                None => Submission::Stopped,
            }
        } else {
            state.queue.push_back(Slot {
                job,
                completion: None,
            });
            Self::schedule_drain(&self.shared, &mut state);
            Submission::Enqueued
        }
    }

    fn stop(&self) {
        let discarded = {
            let mut state = self.shared.state.lock().expect("mailbox lock poisoned");
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        if !discarded.is_empty() {
            warn!(
                mailbox = %self.shared.label,
                count = discarded.len(),
                "mailbox stopped; discarding queued work items"
            );
        }
        for slot in discarded {
            if let Some(completion) = slot.completion {
                completion.discard();
            }
        }
        self.shared.space_ready.notify_all();
        debug!(mailbox = %self.shared.label, "dispatched mailbox stopped");
    }

    fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("mailbox lock poisoned")
            .queue
            .len()
    }

    fn is_stopped(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("mailbox lock poisoned")
            .stopped
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T: Send + 'static> Drop for DispatchedMailbox<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + 'static> std::fmt::Debug for DispatchedMailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedMailbox")
            .field("label", &self.shared.label)
            .field("capacity", &self.shared.capacity)
            .field("queued", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn reply_required_rendezvous_returns_verdict() {
        let dispatcher = Dispatcher::new(2);
        let mailbox: DispatchedMailbox<u32> = DispatchedMailbox::new("rdv", 0, dispatcher.handle());
        assert_eq!(
            mailbox.submit(Box::new(|| Some(17)), true),
            Submission::Completed(17)
        );
    }

    #[test]
    fn items_run_in_fifo_order() {
        let dispatcher = Dispatcher::new(4);
        let mailbox: DispatchedMailbox<u32> =
            DispatchedMailbox::new("fifo", 0, dispatcher.handle());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let order = Arc::clone(&order);
            let submission = mailbox.submit(
                Box::new(move || {
                    order.lock().unwrap().push(i);
                    None
                }),
                false,
            );
            assert_eq!(submission, Submission::Enqueued);
        }
        assert_eq!(mailbox.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(*order.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn at_most_one_item_runs_at_a_time() {
        let dispatcher = Dispatcher::new(4);
        let mailbox: DispatchedMailbox<u32> =
            DispatchedMailbox::new("serial", 0, dispatcher.handle());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            let submission = mailbox.submit(
                Box::new(move || {
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_micros(200));
                    inside.store(false, Ordering::SeqCst);
                    None
                }),
                false,
            );
            assert_eq!(submission, Submission::Enqueued);
        }
        assert_eq!(mailbox.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_discards_queue_and_rejects_submissions() {
        let dispatcher = Dispatcher::new(1);
        let mailbox: DispatchedMailbox<u32> =
            DispatchedMailbox::new("stop", 0, dispatcher.handle());
        mailbox.stop();
        assert!(mailbox.is_stopped());
        assert_eq!(mailbox.submit(Box::new(|| None), false), Submission::Stopped);
        assert_eq!(mailbox.submit(Box::new(|| Some(1)), true), Submission::Stopped);
    }

    #[test]
    fn two_mailboxes_share_one_dispatcher() {
        let dispatcher = Dispatcher::new(2);
        let a: DispatchedMailbox<u32> = DispatchedMailbox::new("a", 0, dispatcher.handle());
        let b: DispatchedMailbox<u32> = DispatchedMailbox::new("b", 0, dispatcher.handle());
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            for mailbox in [&a, &b] {
                let hits = Arc::clone(&hits);
                let submission = mailbox.submit(
                    Box::new(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                        None
                    }),
                    false,
                );
                assert_eq!(submission, Submission::Enqueued);
            }
        }
        assert_eq!(a.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(b.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(hits.load(Ordering::SeqCst), 40);
    }
}
