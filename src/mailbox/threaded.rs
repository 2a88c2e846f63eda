//! Mailbox backed by one dedicated worker thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, trace, warn};

use super::{run_slot, Completion, Job, Mailbox, Slot, Submission};

struct QueueState<T: Send + 'static> {
    queue: VecDeque<Slot<T>>,
    stopped: bool,
}

struct Shared<T: Send + 'static> {
    label: String,
    /// `0` means unbounded.
    capacity: usize,
    state: Mutex<QueueState<T>>,
    /// Signalled when an item is enqueued or the mailbox stops.
    work_ready: Condvar,
    /// Signalled when the worker pops an item off a bounded queue.
    space_ready: Condvar,
}

/// A [`Mailbox`] whose items run on a private worker thread.
///
/// The worker blocks on the queue, pops one item, runs it, signals the
/// rendezvous (if any), and repeats. [`stop`](Mailbox::stop) flips the stop
/// flag and wakes the worker, which then exits.
pub struct ThreadedMailbox<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ThreadedMailbox<T> {
    /// Creates the mailbox and spawns its worker thread.
    ///
    /// `label` names the worker (`<label>-mailbox`); `capacity` of `0` means
    /// unbounded.
    #[must_use]
    pub fn new(label: &str, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            label: label.to_string(),
            capacity,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        // Detached on purpose: the worker exits on its own once the stop
        // flag is raised, so nothing ever joins it.
        let _ = thread::Builder::new()
            .name(format!("{label}-mailbox"))
            .spawn(move || worker_loop(&worker))
            .expect("failed to spawn mailbox worker");

        debug!(mailbox = %label, capacity, "threaded mailbox started");
        Self { shared }
    }
}

impl<T: Send + 'static> Mailbox<T> for ThreadedMailbox<T> {
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
            // Reply-required submissions block for space instead of failing.
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
            self.shared.work_ready.notify_one();
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
            self.shared.work_ready.notify_one();
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
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        debug!(mailbox = %self.shared.label, "threaded mailbox stopped");
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

impl<T: Send + 'static> Drop for ThreadedMailbox<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + 'static> std::fmt::Debug for ThreadedMailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedMailbox")
            .field("label", &self.shared.label)
            .field("capacity", &self.shared.capacity)
            .field("queued", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn worker_loop<T: Send + 'static>(shared: &Shared<T>) {
    loop {
        let slot = {
            let mut state = shared.state.lock().expect("mailbox lock poisoned");
            loop {
                if state.stopped {
                    return;
                }
                if let Some(slot) = state.queue.pop_front() {
                    break slot;
                }
                state = shared
                    .work_ready
                    .wait(state)
                    .expect("mailbox lock poisoned");
            }
        };
        shared.space_ready.notify_one();
        run_slot(slot, &shared.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn enqueue_probe(mailbox: &ThreadedMailbox<u32>, hits: &Arc<AtomicUsize>) {
        let hits = Arc::clone(hits);
        let submission = mailbox.submit(
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                None
            }),
            false,
        );
        assert_eq!(submission, Submission::Enqueued);
    }

    #[test]
    fn reply_required_rendezvous_returns_verdict() {
        let mailbox: ThreadedMailbox<u32> = ThreadedMailbox::new("rdv", 0);
        let submission = mailbox.submit(Box::new(|| Some(11)), true);
        assert_eq!(submission, Submission::Completed(11));
    }

    #[test]
    fn items_run_in_fifo_order() {
        let mailbox: ThreadedMailbox<u32> = ThreadedMailbox::new("fifo", 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
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
        // Rendezvous behind the casts guarantees they have all run.
        assert_eq!(mailbox.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn stop_discards_queued_items_and_rejects_new_ones() {
        let mailbox: ThreadedMailbox<u32> = ThreadedMailbox::new("stop", 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Occupy the worker so the next items stay queued.
        let submission = mailbox.submit(
            Box::new(move || {
                let _ = gate_rx.recv();
                None
            }),
            false,
        );
        assert_eq!(submission, Submission::Enqueued);
        thread::sleep(Duration::from_millis(20));
        enqueue_probe(&mailbox, &hits);
        enqueue_probe(&mailbox, &hits);

        mailbox.stop();
        let _ = gate_tx.send(());

        assert!(mailbox.is_stopped());
        assert_eq!(mailbox.submit(Box::new(|| Some(1)), true), Submission::Stopped);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_wakes_blocked_reply_submitter() {
        let mailbox: Arc<ThreadedMailbox<u32>> = Arc::new(ThreadedMailbox::new("wake", 0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let busy = mailbox.submit(
            Box::new(move || {
                let _ = gate_rx.recv();
                None
            }),
            false,
        );
        assert_eq!(busy, Submission::Enqueued);

        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.submit(Box::new(|| Some(1)), true))
        };
        thread::sleep(Duration::from_millis(20));
        mailbox.stop();
        let _ = gate_tx.send(());
        assert_eq!(waiter.join().unwrap(), Submission::Stopped);
    }

    #[test]
    fn bounded_mailbox_rejects_casts_at_capacity() {
        let mailbox: ThreadedMailbox<u32> = ThreadedMailbox::new("full", 2);
        let hits = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let busy = mailbox.submit(
            Box::new(move || {
                let _ = gate_rx.recv();
                None
            }),
            false,
        );
        assert_eq!(busy, Submission::Enqueued);
        thread::sleep(Duration::from_millis(20));

        enqueue_probe(&mailbox, &hits);
        enqueue_probe(&mailbox, &hits);
        let overflow = mailbox.submit(Box::new(|| None), false);
        assert_eq!(overflow, Submission::Full);

        gate_tx.send(()).unwrap();
        assert_eq!(mailbox.submit(Box::new(|| Some(0)), true), Submission::Completed(0));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bounded_mailbox_blocks_reply_submission_until_space() {
        let mailbox: Arc<ThreadedMailbox<u32>> = Arc::new(ThreadedMailbox::new("block", 1));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let busy = mailbox.submit(
            Box::new(move || {
                let _ = gate_rx.recv();
                None
            }),
            false,
        );
        assert_eq!(busy, Submission::Enqueued);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(mailbox.submit(Box::new(|| None), false), Submission::Enqueued);

        let blocked = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.submit(Box::new(|| Some(9)), true))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.is_finished());

        gate_tx.send(()).unwrap();
        assert_eq!(blocked.join().unwrap(), Submission::Completed(9));
    }
}
