//! The collaborator contract a server attaches to.
//!
//! The core consumes exactly one capability from a system: a shared
//! [`DispatcherHandle`]. Everything else a system might be (registries,
//! supervision, node membership) is out of scope here; the core never
//! creates or tears down a system's dispatcher.

use std::fmt;
use std::time::Duration;

use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherOptions};

/// Provides the shared dispatcher that servers attached to this system run
/// on.
///
/// The dispatcher is shared across all attached servers and must live as
/// long as the system does.
pub trait System: Send + Sync {
    /// Handle to the system's shared dispatcher.
    fn dispatcher(&self) -> DispatcherHandle;
}

/// A minimal [`System`]: a named wrapper around one owned [`Dispatcher`].
///
/// Enough to run dispatched servers stand-alone; a larger application would
/// implement [`System`] on its own runtime object instead.
pub struct ThreadPoolSystem {
    dispatcher: Dispatcher,
}

impl ThreadPoolSystem {
    /// Creates a system whose dispatcher has `workers` threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(workers),
        }
    }

    /// Creates a system with custom dispatcher options.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    #[must_use]
    pub fn with_options(workers: usize, options: DispatcherOptions) -> Self {
        Self {
            dispatcher: Dispatcher::with_options(workers, options),
        }
    }

    /// Shuts the dispatcher down and joins its workers.
    ///
    /// Servers still attached to this system stop making progress once the
    /// pool is gone; stop them first.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.dispatcher.shutdown_and_wait(timeout)
    }
}

impl System for ThreadPoolSystem {
    fn dispatcher(&self) -> DispatcherHandle {
        self.dispatcher.handle()
    }
}

impl fmt::Debug for ThreadPoolSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolSystem")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
