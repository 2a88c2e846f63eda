//! The server object and the call/cast protocol.
//!
//! A [`Server`] owns a name, private user state, and exactly one mailbox.
//! Handlers live behind the [`Behavior`] seam: `handle_call` for
//! request-response messages, `handle_cast` for fire-and-forget ones. The
//! runtime enforces the single-writer discipline: state is read and replaced
//! only from inside handler invocations scheduled by the mailbox, so user
//! code needs no synchronization of its own.
//!
//! # Protocol
//!
//! Every submission becomes a *work item* (message, reply-expected flag,
//! optional sender). For each dequeued item the runtime:
//!
//! 1. yields [`CallError::Stopped`] without running anything if the server
//!    is no longer running;
//! 2. handles the internal stop message (cooperative shutdown);
//! 3. runs the user handler inside a panic trap;
//! 4. interprets the handler result: `Some(Handled::Reply(r, s'))` replaces
//!    the state with `s'` and yields `r`; `Some(Handled::Stop)` stops the
//!    server; `None` yields [`CallError::Unhandled`];
//! 5. casts the verdict to the sender when one was provided (the async-call
//!    reply path) unless the verdict is `Stopped`;
//! 6. hands the verdict to a blocked caller when a reply was required.
//!
//! A handler failure never crashes the mailbox worker: the panic is trapped,
//! logged, and returned to the submitter as [`CallError::Handler`].
//!
//! # Deadlock
//!
//! A handler must not `call` its own server: the single-consumer invariant
//! blocks re-entry and the call never completes. `cast` into self is fine.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::mailbox::{DispatchedMailbox, Job, Mailbox, Submission, ThreadedMailbox};
use crate::reply::ReplySink;
use crate::system::System;

/// What a `call` resolves to.
pub type CallResult<R> = Result<R, CallError>;

/// Why a `call` (or async-call) produced no reply value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The server is not running, or this was the reply to a stop request.
    #[error("server has stopped")]
    Stopped,
    /// The handler declined the message (or no handler is defined).
    #[error("message not handled")]
    Unhandled,
    /// The handler panicked; the server keeps running with its state intact.
    #[error("handler failed: {0}")]
    Handler(String),
    /// The target mailbox is bounded and full. Only surfaced by
    /// [`Server::async_call`]: plain calls block for space instead.
    #[error("mailbox full")]
    QueueFull,
}

/// Why a `cast` was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CastError {
    /// The server is not running.
    #[error("server has stopped")]
    Stopped,
    /// The mailbox is bounded and full.
    #[error("mailbox full")]
    Full,
}

/// A handler's positive result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<R, S> {
    /// Reply with the first value and replace the server state with the
    /// second.
    Reply(R, S),
    /// Stop the server cooperatively.
    Stop,
}

/// The dispatch seam between the runtime and user code.
///
/// Handlers take the current state by reference and produce a fresh state in
/// [`Handled::Reply`]; returning `None` leaves the state untouched and
/// yields [`CallError::Unhandled`] to the submitter. Both defaults return
/// `None`, so implementors override only what they need.
pub trait Behavior: Sized + Send + Sync + 'static {
    /// Message type accepted by this server.
    type Msg: Send + 'static;
    /// Reply type produced by this server.
    ///
    /// `Sync` because async-call shares one reply value with every callback
    /// registered on the promise.
    type Reply: Send + Sync + 'static;
    /// Private state type owned by this server.
    type State: Send + 'static;

    /// Handles a request-response message.
    fn handle_call(
        &self,
        server: &Server<Self>,
        msg: Self::Msg,
        state: &Self::State,
    ) -> Option<Handled<Self::Reply, Self::State>> {
        let _ = (server, msg, state);
        None
    }

    /// Handles a fire-and-forget message.
    fn handle_cast(
        &self,
        server: &Server<Self>,
        msg: Self::Msg,
        state: &Self::State,
    ) -> Option<Handled<Self::Reply, Self::State>> {
        let _ = (server, msg, state);
        None
    }

    /// Runs once after construction, with the initial state borrowed.
    ///
    /// Submitting work to *other* servers from here is fine; a synchronous
    /// `call` into this server would deadlock on the state borrow.
    fn after_init(&self, server: &Server<Self>, state: &Self::State) {
        let _ = (server, state);
    }
}

/// Internal message envelope: user payload or the stop control message.
enum Msg<M> {
    User(M),
    Stop,
}

struct Core<B: Behavior> {
    name: String,
    behavior: B,
    state: Mutex<B::State>,
    running: AtomicBool,
    /// Exactly one mailbox is bound at any instant; re-created on system
    /// attach.
    mailbox: Mutex<Arc<dyn Mailbox<CallResult<B::Reply>>>>,
    system: Mutex<Option<Arc<dyn System>>>,
    max_queue: usize,
}

/// A named stateful entity processing messages one at a time.
///
/// Cheap to clone; clones share the same server. Dropping the last clone
/// stops the mailbox.
pub struct Server<B: Behavior> {
    core: Arc<Core<B>>,
}

impl<B: Behavior> Clone for Server<B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

/// Configures and starts a [`Server`].
pub struct ServerBuilder<B: Behavior> {
    behavior: B,
    state: B::State,
    name: Option<String>,
    max_queue: usize,
    system: Option<Arc<dyn System>>,
}

impl<B: Behavior> Server<B> {
    /// Starts configuring a server around `behavior` and its initial state.
    pub fn builder(behavior: B, state: B::State) -> ServerBuilder<B> {
        ServerBuilder {
            behavior,
            state,
            name: None,
            max_queue: 0,
            system: None,
        }
    }

    /// Starts a server with default options (generated name, unbounded
    /// mailbox, no system).
    pub fn start(behavior: B, state: B::State) -> Self {
        Self::builder(behavior, state).start()
    }

    /// The server's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Best-effort observation of the running flag.
    ///
    /// This may race with a concurrent stop; it is not a synchronization
    /// primitive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// The system this server is attached to, if any.
    #[must_use]
    pub fn system(&self) -> Option<Arc<dyn System>> {
        self.core
            .system
            .lock()
            .expect("server lock poisoned")
            .clone()
    }

    /// Configured mailbox capacity; `0` means unbounded.
    #[must_use]
    pub fn max_queue(&self) -> usize {
        self.core.max_queue
    }

    /// Synchronous request-response.
    ///
    /// Blocks until the handler has run and returns its reply, or an error
    /// value per the protocol taxonomy. Never returns
    /// [`CallError::QueueFull`]: on a bounded, full mailbox the submission
    /// blocks for space.
    pub fn call(&self, msg: B::Msg) -> CallResult<B::Reply> {
        match self.submit(Msg::User(msg), true, None) {
            Submission::Completed(verdict) => verdict,
            Submission::Stopped => Err(CallError::Stopped),
            Submission::Enqueued | Submission::Full => {
                unreachable!("reply-required submissions rendezvous or stop")
            }
        }
    }

    /// Fire-and-forget submission.
    ///
    /// Returns as soon as the message is enqueued; the handler runs later on
    /// the mailbox's execution context.
    pub fn cast(&self, msg: B::Msg) -> Result<(), CastError> {
        match self.submit(Msg::User(msg), false, None) {
            Submission::Enqueued => Ok(()),
            Submission::Stopped => Err(CastError::Stopped),
            Submission::Full => Err(CastError::Full),
            Submission::Completed(_) => {
                unreachable!("fire-and-forget submissions never rendezvous")
            }
        }
    }

    /// Requests orderly shutdown and blocks until it takes effect.
    ///
    /// Resolves to `Err(CallError::Stopped)` once the server has stopped;
    /// repeated stops yield the same value. Queued-but-unstarted work items
    /// are discarded.
    pub fn stop(&self) -> CallResult<B::Reply> {
        match self.submit(Msg::Stop, true, None) {
            Submission::Completed(verdict) => verdict,
            Submission::Stopped => Err(CallError::Stopped),
            Submission::Enqueued | Submission::Full => {
                unreachable!("reply-required submissions rendezvous or stop")
            }
        }
    }

    /// Attaches the server to a system, rebinding it onto the system's
    /// shared dispatcher.
    ///
    /// The current mailbox is stopped and a fresh
    /// [`DispatchedMailbox`] is built in its place. **Any unprocessed
    /// messages in the old mailbox are discarded** (blocked callers wake
    /// with `Stopped`); attach before the server has traffic, not after.
    pub fn attach_system(&self, system: Arc<dyn System>) {
        let dispatcher = system.dispatcher();
        let old = {
            let mut slot = self.core.mailbox.lock().expect("server lock poisoned");
            *self.core.system.lock().expect("server lock poisoned") = Some(system);
            let fresh: Arc<dyn Mailbox<CallResult<B::Reply>>> = Arc::new(DispatchedMailbox::new(
                &self.core.name,
                self.core.max_queue,
                dispatcher,
            ));
            std::mem::replace(&mut *slot, fresh)
        };
        old.stop();
        debug!(server = %self.core.name, "attached to system");
    }

    /// Submits a cast-style work item carrying a sender for reply routing
    /// (the async-call path).
    pub(crate) fn cast_with_sender(
        &self,
        msg: B::Msg,
        sender: Arc<dyn ReplySink<B::Reply>>,
    ) -> Result<(), CastError> {
        match self.submit(Msg::User(msg), false, Some(sender)) {
            Submission::Enqueued => Ok(()),
            Submission::Stopped => Err(CastError::Stopped),
            Submission::Full => Err(CastError::Full),
            Submission::Completed(_) => {
                unreachable!("fire-and-forget submissions never rendezvous")
            }
        }
    }

    /// Immediate shutdown without going through the mailbox.
    pub(crate) fn halt(&self) {
        Core::shutdown(&self.core);
    }

    fn submit(
        &self,
        msg: Msg<B::Msg>,
        reply_required: bool,
        sender: Option<Arc<dyn ReplySink<B::Reply>>>,
    ) -> Submission<CallResult<B::Reply>> {
        if !self.is_running() {
            return Submission::Stopped;
        }
        let core = Arc::clone(&self.core);
        let job: Job<CallResult<B::Reply>> =
            Box::new(move || Core::process(&core, msg, reply_required, sender));
        let mailbox = self
            .core
            .mailbox
            .lock()
            .expect("server lock poisoned")
            .clone();
        trace!(server = %self.core.name, reply_required, "submitting work item");
        mailbox.submit(job, reply_required)
    }
}

impl<B: Behavior> ServerBuilder<B> {
    /// Names the server; defaults to a generated unique token.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bounds the mailbox. `0` (the default) means unbounded; bounds below
    /// 10 are permitted but leave little room before casts start failing.
    #[must_use]
    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Attaches the server to `system` from the start, so it is born on a
    /// [`DispatchedMailbox`] bound to the system's dispatcher.
    #[must_use]
    pub fn system(mut self, system: Arc<dyn System>) -> Self {
        self.system = Some(system);
        self
    }

    /// Builds the mailbox, starts the server, and runs the behavior's
    /// `after_init` hook with the initial state.
    pub fn start(self) -> Server<B> {
        let name = self.name.unwrap_or_else(next_server_name);
        let mailbox: Arc<dyn Mailbox<CallResult<B::Reply>>> = match &self.system {
            Some(system) => Arc::new(DispatchedMailbox::new(
                &name,
                self.max_queue,
                system.dispatcher(),
            )),
            None => Arc::new(ThreadedMailbox::new(&name, self.max_queue)),
        };
        let core = Arc::new(Core {
            name,
            behavior: self.behavior,
            state: Mutex::new(self.state),
            running: AtomicBool::new(true),
            mailbox: Mutex::new(mailbox),
            system: Mutex::new(self.system),
            max_queue: self.max_queue,
        });
        let server = Server { core };
        debug!(server = %server.core.name, "server started");
        {
            let state = server.core.state.lock().expect("server lock poisoned");
            server.core.behavior.after_init(&server, &state);
        }
        server
    }
}

impl<B: Behavior> Core<B> {
    /// Runs one dequeued work item on the mailbox's execution context and
    /// routes its verdict.
    fn process(
        core: &Arc<Self>,
        msg: Msg<B::Msg>,
        reply_required: bool,
        sender: Option<Arc<dyn ReplySink<B::Reply>>>,
    ) -> Option<CallResult<B::Reply>> {
        let call_like = reply_required || sender.is_some();
        let verdict = Self::run_pipeline(core, msg, call_like);
        if let Some(sink) = sender {
            if !matches!(verdict, Err(CallError::Stopped)) {
                sink.deliver(verdict);
            }
            return None;
        }
        reply_required.then_some(verdict)
    }

    fn run_pipeline(core: &Arc<Self>, msg: Msg<B::Msg>, call_like: bool) -> CallResult<B::Reply> {
        if !core.running.load(Ordering::Acquire) {
            return Err(CallError::Stopped);
        }

        let user_msg = match msg {
            Msg::Stop => {
                Self::shutdown(core);
                return Err(CallError::Stopped);
            }
            Msg::User(user_msg) => user_msg,
        };

        let server = Server {
            core: Arc::clone(core),
        };
        let mut state = core.state.lock().expect("server lock poisoned");
        let outcome = {
            let behavior = &core.behavior;
            let server = &server;
            let state: &B::State = &state;
            catch_unwind(AssertUnwindSafe(move || {
                if call_like {
                    behavior.handle_call(server, user_msg, state)
                } else {
                    behavior.handle_cast(server, user_msg, state)
                }
            }))
        };

        match outcome {
            Err(payload) => {
                let description = panic_description(payload.as_ref());
                warn!(
                    server = %core.name,
                    error = %description,
                    "handler panicked; server continues"
                );
                Err(CallError::Handler(description))
            }
            Ok(None) => Err(CallError::Unhandled),
            Ok(Some(Handled::Stop)) => {
                drop(state);
                Self::shutdown(core);
                Err(CallError::Stopped)
            }
            Ok(Some(Handled::Reply(reply, next_state))) => {
                *state = next_state;
                Ok(reply)
            }
        }
    }

    fn shutdown(core: &Arc<Self>) {
        if core.running.swap(false, Ordering::AcqRel) {
            debug!(server = %core.name, "server stopping");
            let mailbox = core
                .mailbox
                .lock()
                .expect("server lock poisoned")
                .clone();
            mailbox.stop();
        }
    }
}

fn next_server_name() -> String {
    static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(0);
    format!("server-{}", NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
}

fn panic_description(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl<B: Behavior> fmt::Debug for Server<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queued = self
            .core
            .mailbox
            .lock()
            .expect("server lock poisoned")
            .len();
        f.debug_struct("Server")
            .field("name", &self.core.name)
            .field("running", &self.is_running())
            .field("queued", &queued)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    // ---- Counter behavior ----

    struct Counter;

    enum CounterMsg {
        Inc,
        Get,
        Boom,
        Quit,
    }

    impl Behavior for Counter {
        type Msg = CounterMsg;
        type Reply = u64;
        type State = u64;

        fn handle_call(
            &self,
            _server: &Server<Self>,
            msg: CounterMsg,
            state: &u64,
        ) -> Option<Handled<u64, u64>> {
            match msg {
                CounterMsg::Get => Some(Handled::Reply(*state, *state)),
                CounterMsg::Inc => Some(Handled::Reply(*state + 1, *state + 1)),
                CounterMsg::Boom => panic!("counter exploded"),
                CounterMsg::Quit => Some(Handled::Stop),
            }
        }

        fn handle_cast(
            &self,
            _server: &Server<Self>,
            msg: CounterMsg,
            state: &u64,
        ) -> Option<Handled<u64, u64>> {
            match msg {
                CounterMsg::Inc => Some(Handled::Reply(*state + 1, *state + 1)),
                _ => None,
            }
        }
    }

    #[test]
    fn casts_then_call_observe_updated_state() {
        let server = Server::start(Counter, 0);
        server.cast(CounterMsg::Inc).unwrap();
        server.cast(CounterMsg::Inc).unwrap();
        server.cast(CounterMsg::Inc).unwrap();
        assert_eq!(server.call(CounterMsg::Get), Ok(3));
        let _ = server.stop();
    }

    #[test]
    fn call_replaces_state_and_returns_reply() {
        let server = Server::start(Counter, 10);
        assert_eq!(server.call(CounterMsg::Inc), Ok(11));
        assert_eq!(server.call(CounterMsg::Get), Ok(11));
        let _ = server.stop();
    }

    #[test]
    fn handler_panic_is_isolated_and_state_survives() {
        let server = Server::start(Counter, 0);
        assert_eq!(server.call(CounterMsg::Inc), Ok(1));
        assert_eq!(
            server.call(CounterMsg::Boom),
            Err(CallError::Handler("counter exploded".to_string()))
        );
        assert!(server.is_running());
        assert_eq!(server.call(CounterMsg::Get), Ok(1));
        let _ = server.stop();
    }

    #[test]
    fn unhandled_cast_message_leaves_state_untouched() {
        let server = Server::start(Counter, 5);
        // Get is not a cast the counter handles; rendezvous behind it to
        // observe the result deterministically.
        server.cast(CounterMsg::Get).unwrap();
        assert_eq!(server.call(CounterMsg::Get), Ok(5));
        let _ = server.stop();
    }

    #[test]
    fn stop_is_permanent_and_idempotent() {
        let server = Server::start(Counter, 0);
        assert_eq!(server.stop(), Err(CallError::Stopped));
        assert!(!server.is_running());
        assert_eq!(server.call(CounterMsg::Get), Err(CallError::Stopped));
        assert_eq!(server.cast(CounterMsg::Inc), Err(CastError::Stopped));
        assert_eq!(server.stop(), Err(CallError::Stopped));
    }

    #[test]
    fn handler_requested_stop_reaches_the_caller() {
        let server = Server::start(Counter, 0);
        assert_eq!(server.call(CounterMsg::Quit), Err(CallError::Stopped));
        assert!(!server.is_running());
        assert_eq!(server.cast(CounterMsg::Inc), Err(CastError::Stopped));
    }

    #[test]
    fn generated_names_are_unique() {
        let a = Server::start(Counter, 0);
        let b = Server::start(Counter, 0);
        assert_ne!(a.name(), b.name());
        let _ = a.stop();
        let _ = b.stop();
    }

    #[test]
    fn attach_system_discards_queued_messages() {
        use crate::system::ThreadPoolSystem;

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);

        struct Blocker {
            gate: Mutex<mpsc::Receiver<()>>,
        }
        impl Behavior for Blocker {
            type Msg = ();
            type Reply = ();
            type State = ();
            fn handle_cast(
                &self,
                _server: &Server<Self>,
                _msg: (),
                _state: &(),
            ) -> Option<Handled<(), ()>> {
                let _ = self.gate.lock().unwrap().recv();
                Some(Handled::Reply((), ()))
            }
        }

        let blocker = Server::start(Blocker { gate }, ());
        blocker.cast(()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // These stay queued behind the blocked handler and get discarded by
        // the attach below.
        blocker.cast(()).unwrap();
        blocker.cast(()).unwrap();

        let system = Arc::new(ThreadPoolSystem::new(2));
        blocker.attach_system(system);
        let _ = gate_tx.send(());

        // The server itself keeps running on its fresh mailbox.
        assert!(blocker.is_running());
        let _ = blocker.stop();
    }

    #[test]
    fn server_on_system_processes_messages() {
        use crate::system::ThreadPoolSystem;

        let system = Arc::new(ThreadPoolSystem::new(2));
        let server = Server::builder(Counter, 0).system(system).start();
        server.cast(CounterMsg::Inc).unwrap();
        server.cast(CounterMsg::Inc).unwrap();
        assert_eq!(server.call(CounterMsg::Get), Ok(2));
        let _ = server.stop();
    }
}
