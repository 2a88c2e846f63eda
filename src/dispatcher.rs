//! Shared worker pool executing submitted tasks.
//!
//! A [`Dispatcher`] owns a fixed set of OS worker threads fed from a single
//! lock-free injector queue. Many [`DispatchedMailbox`](crate::mailbox::DispatchedMailbox)es
//! share one dispatcher; each mailbox serializes its own drain tasks, so the
//! pool only ever sees at most one task per mailbox in flight.
//!
//! The dispatcher is an injected collaborator: whoever builds it (usually a
//! [`System`](crate::system::System)) owns its lifecycle. Mailboxes hold only
//! cloneable [`DispatcherHandle`]s and must not outlive the pool.
//!
//! # Shutdown
//!
//! [`shutdown`](Dispatcher::shutdown) stops task intake; workers finish the
//! queue and exit. [`shutdown_and_wait`](Dispatcher::shutdown_and_wait)
//! additionally joins the workers with a bounded timeout.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Configuration options for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Prefix for worker thread names (`<prefix>-dispatch-<n>`).
    pub thread_name_prefix: String,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "genserv".to_string(),
        }
    }
}

struct Inner {
    workers: usize,
    queue: SegQueue<Task>,
    pending: AtomicUsize,
    busy: AtomicUsize,
    active: AtomicUsize,
    shutdown: AtomicBool,
    /// Condition variable for worker parking.
    condvar: Condvar,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A fixed-size worker pool with a `dispatch(task)` entry point.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// A cloneable handle to a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher with `workers` threads, spawned eagerly.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self::with_options(workers, DispatcherOptions::default())
    }

    /// Creates a dispatcher with custom options.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    #[must_use]
    pub fn with_options(workers: usize, options: DispatcherOptions) -> Self {
        assert!(workers > 0, "dispatcher needs at least one worker");

        let inner = Arc::new(Inner {
            workers,
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            thread_handles: Mutex::new(Vec::with_capacity(workers)),
        });

        for index in 0..workers {
            let worker = Arc::clone(&inner);
            worker.active.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}-dispatch-{index}", options.thread_name_prefix);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || {
                    worker_loop(&worker);
                    worker.active.fetch_sub(1, Ordering::Relaxed);
                })
                .expect("failed to spawn dispatcher worker");
            inner
                .thread_handles
                .lock()
                .expect("dispatcher lock poisoned")
                .push(handle);
        }

        debug!(workers, "dispatcher started");
        Self { inner }
    }

    /// Returns a cloneable handle to this dispatcher.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Runs `task` on one of the worker threads, eventually.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().dispatch(task);
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// Number of workers currently executing a task.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Configured worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers
    }

    /// `true` once shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown: no new tasks are accepted, queued tasks still run.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().expect("dispatcher lock poisoned");
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `true` if the workers exited within `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Wake parked workers so they notice the shutdown flag.
            {
                let _guard = self.inner.mutex.lock().expect("dispatcher lock poisoned");
                self.inner.condvar.notify_all();
            }
            thread::sleep(Duration::from_millis(5).min(remaining));
        }

        let mut handles = self
            .inner
            .thread_handles
            .lock()
            .expect("dispatcher lock poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl DispatcherHandle {
    /// Runs `task` on one of the pool's worker threads, eventually.
    ///
    /// Tasks dispatched after shutdown are dropped (logged at `warn`).
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("task dispatched after dispatcher shutdown; dropping");
            return;
        }
        self.inner.queue.push(Box::new(task));
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        let _guard = self.inner.mutex.lock().expect("dispatcher lock poisoned");
        self.inner.condvar.notify_one();
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// `true` once the pool has shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        if let Some(task) = inner.queue.pop() {
            inner.pending.fetch_sub(1, Ordering::Relaxed);
            inner.busy.fetch_add(1, Ordering::Relaxed);
            task();
            inner.busy.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let guard = inner.mutex.lock().expect("dispatcher lock poisoned");
        // Re-check under the lock so a push between the failed pop and the
        // wait cannot be missed.
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        let _guard = inner.condvar.wait(guard).expect("dispatcher lock poisoned");
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.inner.workers)
            .field("pending", &self.pending_count())
            .field("busy", &self.busy_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
