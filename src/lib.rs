//! Genserv: a GenServer-style message-processing runtime.
//!
//! # Overview
//!
//! A [`Server`](server::Server) is a lightweight, named, stateful entity that
//! owns private state and processes messages from its mailbox one at a time.
//! Callers interact with it three ways:
//!
//! - **Call**: synchronous request-response. The caller blocks until the
//!   server's handler has run and replies.
//! - **Cast**: asynchronous fire-and-forget. The sender does not wait.
//! - **Async-call**: non-blocking request whose reply arrives through a
//!   [`Promise`](promise::Promise), routed via an ephemeral helper server.
//!
//! # Core Guarantees
//!
//! - **Single-consumer discipline**: at most one handler runs per server at
//!   any instant, on the mailbox's execution context.
//! - **FIFO per mailbox**: work items run in strict enqueue order.
//! - **Error isolation**: a panicking handler never takes down the mailbox
//!   worker; the failure comes back to the submitter as a value.
//! - **Single-writer state**: server state is observed and replaced only from
//!   inside handler invocations scheduled by the mailbox.
//!
//! # Execution Backends
//!
//! A server without a system runs on a [`ThreadedMailbox`]
//! (one dedicated worker thread). A server attached to a
//! [`System`](system::System) runs on a [`DispatchedMailbox`]
//! multiplexed onto the system's shared [`Dispatcher`](dispatcher::Dispatcher)
//! pool.
//!
//! # Module Structure
//!
//! - [`server`]: the server object, the [`Behavior`](server::Behavior) seam,
//!   and the call/cast protocol
//! - [`simple`]: servers whose handlers are supplied as inline closures
//! - [`mailbox`]: the FIFO + execution binding that schedules handlers
//! - [`dispatcher`]: the shared worker pool behind dispatched mailboxes
//! - [`system`]: the collaborator contract a server attaches to
//! - [`promise`]: one-shot result cell with completion callbacks
//!
//! # Example
//!
//! ```
//! use genserv::{Handled, Server, SimpleServer};
//!
//! enum Msg {
//!     Inc,
//!     Get,
//! }
//!
//! let behavior = SimpleServer::new()
//!     .on_cast(|_server, msg: Msg, count: &u64| match msg {
//!         Msg::Inc => Some(Handled::Reply(*count + 1, *count + 1)),
//!         Msg::Get => None,
//!     })
//!     .on_call(|_server, msg: Msg, count: &u64| match msg {
//!         Msg::Get => Some(Handled::Reply(*count, *count)),
//!         Msg::Inc => None,
//!     });
//!
//! let counter = Server::builder(behavior, 0).name("counter").start();
//! counter.cast(Msg::Inc).unwrap();
//! counter.cast(Msg::Inc).unwrap();
//! assert_eq!(counter.call(Msg::Get), Ok(2));
//! let _ = counter.stop();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod mailbox;
pub mod promise;
mod reply;
pub mod server;
pub mod simple;
pub mod system;

pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherOptions};
pub use mailbox::{DispatchedMailbox, Mailbox, Submission, ThreadedMailbox};
pub use promise::{Completer, Promise};
pub use server::{Behavior, CallError, CallResult, CastError, Handled, Server, ServerBuilder};
pub use simple::SimpleServer;
pub use system::{System, ThreadPoolSystem};
