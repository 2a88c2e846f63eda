//! Async-call reply plumbing.
//!
//! `async_call` returns immediately with a [`Promise`] and routes the reply
//! through an ephemeral *waiter* server: the original message goes to the
//! target as a fire-and-forget work item carrying the waiter as sender; once
//! the target's runtime has a verdict it casts it back to the waiter, whose
//! cast handler completes the promise and stops the waiter.
//!
//! The waiter is a one-shot continuation carrier: no state, a single cast,
//! then gone. It attaches to the same system as the target (if any) so the
//! whole exchange stays on one dispatcher.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::promise::{Completer, Promise};
use crate::server::{Behavior, CallError, CallResult, CastError, Handled, Server};

/// Where a work item's verdict goes when the submitter is not blocked on it.
///
/// Implemented by servers whose message type is the verdict space of the
/// target, which is exactly what the async-call waiter is.
pub(crate) trait ReplySink<R: Send + Sync + 'static>: Send + Sync {
    /// Delivers the verdict; losing it because the sink stopped is fine.
    fn deliver(&self, verdict: CallResult<R>);
}

impl<R, B> ReplySink<R> for Server<B>
where
    R: Send + Sync + 'static,
    B: Behavior<Msg = CallResult<R>>,
{
    fn deliver(&self, verdict: CallResult<R>) {
        if self.cast(verdict).is_err() {
            trace!(server = %self.name(), "reply dropped: sink already stopped");
        }
    }
}

/// Ephemeral server that receives one async-call reply, completes the
/// promise, and stops itself.
pub(crate) struct AsyncCallWaiter<B: Behavior> {
    completer: Completer<CallResult<B::Reply>>,
    target: Server<B>,
    /// Taken exactly once, in `after_init`.
    message: Mutex<Option<B::Msg>>,
}

impl<B: Behavior> Behavior for AsyncCallWaiter<B> {
    type Msg = CallResult<B::Reply>;
    type Reply = ();
    type State = ();

    fn handle_cast(
        &self,
        _server: &Server<Self>,
        verdict: CallResult<B::Reply>,
        _state: &(),
    ) -> Option<Handled<(), ()>> {
        self.completer.complete(verdict);
        Some(Handled::Stop)
    }

    fn after_init(&self, server: &Server<Self>, _state: &()) {
        let Some(message) = self.message.lock().expect("waiter lock poisoned").take() else {
            return;
        };
        let sink: Arc<dyn ReplySink<B::Reply>> = Arc::new(server.clone());
        match self.target.cast_with_sender(message, sink) {
            Ok(()) => {}
            Err(CastError::Stopped) => {
                self.completer.complete(Err(CallError::Stopped));
                server.halt();
            }
            Err(CastError::Full) => {
                self.completer.complete(Err(CallError::QueueFull));
                server.halt();
            }
        }
    }
}

impl<B: Behavior> Drop for AsyncCallWaiter<B> {
    fn drop(&mut self) {
        // Covers the race where the target stops (discarding the queued work
        // item, and with it the only sink reference) before a verdict was
        // routed. Idempotent: a normally-delivered verdict already won.
        self.completer.complete(Err(CallError::Stopped));
    }
}

impl<B: Behavior> Server<B> {
    /// Non-blocking request whose reply arrives through a [`Promise`].
    ///
    /// The promise resolves to exactly what [`call`](Server::call) would
    /// have returned, except that a target that stops before handling the
    /// message resolves it to `Err(CallError::Stopped)`, and a bounded, full
    /// target mailbox resolves it to `Err(CallError::QueueFull)` (the
    /// fire-and-forget submission cannot block for space).
    pub fn async_call(&self, msg: B::Msg) -> Promise<CallResult<B::Reply>> {
        Promise::new(|completer| {
            let waiter = AsyncCallWaiter {
                completer,
                target: self.clone(),
                message: Mutex::new(Some(msg)),
            };
            let builder =
                Server::builder(waiter, ()).name(format!("{}-waiter", self.name()));
            let builder = match self.system() {
                Some(system) => builder.system(system),
                None => builder,
            };
            // after_init fires inside start() and submits the message; the
            // waiter handle itself can be dropped right away.
            let _waiter = builder.start();
        })
    }
}
