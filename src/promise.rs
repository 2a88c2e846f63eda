//! One-shot result cell with completion callbacks.
//!
//! A [`Promise`] starts empty and becomes fulfilled with exactly one value.
//! Fulfillment happens through a [`Completer`], the one-shot hook handed to
//! the computation that produces the value. Interested parties register
//! callbacks with [`Promise::on_complete`]; each registered callback fires
//! exactly once, promptly if the promise is already fulfilled at registration
//! time.
//!
//! # Thread Safety
//!
//! `complete` and `on_complete` may race from different threads: fulfillment
//! is serialized under an internal lock, and completion is idempotent (the
//! first value wins, later attempts are ignored).
//!
//! # Example
//!
//! ```
//! use genserv::promise::Promise;
//!
//! let promise = Promise::new(|completer| {
//!     std::thread::spawn(move || {
//!         completer.complete(21 * 2);
//!     });
//! });
//! assert_eq!(promise.wait(), 42);
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

enum PromiseState<T: 'static> {
    /// Not yet fulfilled; callbacks are parked here until the value arrives.
    Pending(Vec<Callback<T>>),
    /// Fulfilled. The value is shared so late callbacks can still observe it.
    Fulfilled(Arc<T>),
}

struct Inner<T: 'static> {
    state: Mutex<PromiseState<T>>,
    fulfilled: Condvar,
}

/// A one-shot cell that will eventually hold a value of type `T`.
pub struct Promise<T: 'static> {
    inner: Arc<Inner<T>>,
}

/// The one-shot completion hook for a [`Promise`].
///
/// Cloneable so the producing computation can hand it across threads; only
/// the first [`complete`](Completer::complete) takes effect.
pub struct Completer<T: 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a promise and immediately invokes `computation` with its
    /// completer.
    ///
    /// The computation typically moves the completer somewhere that will
    /// eventually call [`Completer::complete`]; it may also complete
    /// synchronously before `new` returns.
    pub fn new(computation: impl FnOnce(Completer<T>)) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(PromiseState::Pending(Vec::new())),
            fulfilled: Condvar::new(),
        });
        let promise = Self {
            inner: Arc::clone(&inner),
        };
        computation(Completer { inner });
        promise
    }

    /// Registers a callback invoked exactly once with the fulfilled value.
    ///
    /// If the promise is already fulfilled the callback runs on the calling
    /// thread before `on_complete` returns; otherwise it runs on the thread
    /// that fulfills the promise.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.inner.state.lock().expect("promise lock poisoned");
            match &mut *state {
                PromiseState::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                PromiseState::Fulfilled(value) => Arc::clone(value),
            }
        };
        callback(&value);
    }

    /// Returns `true` once the promise has been fulfilled.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("promise lock poisoned"),
            PromiseState::Fulfilled(_)
        )
    }

    /// Returns a copy of the fulfilled value, if any.
    #[must_use]
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        match &*self.inner.state.lock().expect("promise lock poisoned") {
            PromiseState::Fulfilled(value) => Some((**value).clone()),
            PromiseState::Pending(_) => None,
        }
    }

    /// Blocks the calling thread until the promise is fulfilled.
    #[must_use]
    pub fn wait(&self) -> T
    where
        T: Clone,
    {
        let mut state = self.inner.state.lock().expect("promise lock poisoned");
        loop {
            match &*state {
                PromiseState::Fulfilled(value) => return (**value).clone(),
                PromiseState::Pending(_) => {
                    state = self
                        .inner
                        .fulfilled
                        .wait(state)
                        .expect("promise lock poisoned");
                }
            }
        }
    }

    /// Blocks until the promise is fulfilled or the timeout elapses.
    ///
    /// Returns `None` if the timeout elapsed first.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T>
    where
        T: Clone,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("promise lock poisoned");
        loop {
            match &*state {
                PromiseState::Fulfilled(value) => return Some((**value).clone()),
                PromiseState::Pending(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, _result) = self
                        .inner
                        .fulfilled
                        .wait_timeout(state, remaining)
                        .expect("promise lock poisoned");
                    state = guard;
                }
            }
        }
    }
}

impl<T: Send + 'static> Completer<T> {
    /// Fulfills the promise with `value`.
    ///
    /// The first call wins and returns `true`; later calls are ignored and
    /// return `false`. Parked callbacks run on this thread, in registration
    /// order, before `complete` returns.
    pub fn complete(&self, value: T) -> bool {
        let (callbacks, shared) = {
            let mut state = self.inner.state.lock().expect("promise lock poisoned");
            match &mut *state {
                PromiseState::Fulfilled(_) => {
                    trace!("promise already fulfilled; extra completion ignored");
                    return false;
                }
                PromiseState::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    let shared = Arc::new(value);
                    *state = PromiseState::Fulfilled(Arc::clone(&shared));
                    (callbacks, shared)
                }
            }
        };
        self.inner.fulfilled.notify_all();
        for callback in callbacks {
            callback(&shared);
        }
        true
    }

    /// Returns `true` once the underlying promise has been fulfilled.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("promise lock poisoned"),
            PromiseState::Fulfilled(_)
        )
    }
}

impl<T: 'static> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fulfilled = matches!(
            *self.inner.state.lock().expect("promise lock poisoned"),
            PromiseState::Fulfilled(_)
        );
        f.debug_struct("Promise").field("fulfilled", &fulfilled).finish()
    }
}

impl<T: 'static> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}
