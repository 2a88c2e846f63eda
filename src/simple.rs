//! Servers whose handlers are supplied as inline closures.
//!
//! [`SimpleServer`] is the no-boilerplate alternative to implementing
//! [`Behavior`](crate::server::Behavior) on a type of your own: collect up
//! to three closures, hand the result to
//! [`Server::builder`](crate::server::Server::builder), done. A handler
//! that was never supplied yields the unhandled verdict for every message.
//!
//! ```
//! use genserv::{Handled, Server, SimpleServer};
//!
//! let echo = SimpleServer::new()
//!     .on_call(|_server, msg: String, _state: &()| Some(Handled::Reply(msg, ())));
//! let server = Server::start(echo, ());
//! assert_eq!(server.call("hi".to_string()), Ok("hi".to_string()));
//! let _ = server.stop();
//! ```

use std::fmt;

use crate::server::{Behavior, Handled, Server};

type HandlerFn<M, R, S> =
    Box<dyn Fn(&Server<SimpleServer<M, R, S>>, M, &S) -> Option<Handled<R, S>> + Send + Sync>;
type InitFn<M, R, S> = Box<dyn Fn(&Server<SimpleServer<M, R, S>>, &S) + Send + Sync>;

/// A [`Behavior`] assembled from optional closures.
pub struct SimpleServer<M, R, S>
where
    M: Send + 'static,
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    call_fn: Option<HandlerFn<M, R, S>>,
    cast_fn: Option<HandlerFn<M, R, S>>,
    init_fn: Option<InitFn<M, R, S>>,
}

impl<M, R, S> SimpleServer<M, R, S>
where
    M: Send + 'static,
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    /// A behavior with no handlers; every message comes back unhandled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            call_fn: None,
            cast_fn: None,
            init_fn: None,
        }
    }

    /// Sets the call handler.
    #[must_use]
    pub fn on_call<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Server<Self>, M, &S) -> Option<Handled<R, S>> + Send + Sync + 'static,
    {
        self.call_fn = Some(Box::new(handler));
        self
    }

    /// Sets the cast handler.
    #[must_use]
    pub fn on_cast<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Server<Self>, M, &S) -> Option<Handled<R, S>> + Send + Sync + 'static,
    {
        self.cast_fn = Some(Box::new(handler));
        self
    }

    /// Sets the hook that runs once after construction.
    #[must_use]
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Server<Self>, &S) + Send + Sync + 'static,
    {
        self.init_fn = Some(Box::new(hook));
        self
    }
}

impl<M, R, S> Default for SimpleServer<M, R, S>
where
    M: Send + 'static,
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M, R, S> Behavior for SimpleServer<M, R, S>
where
    M: Send + 'static,
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    type Msg = M;
    type Reply = R;
    type State = S;

    fn handle_call(&self, server: &Server<Self>, msg: M, state: &S) -> Option<Handled<R, S>> {
        self.call_fn.as_ref().and_then(|f| f(server, msg, state))
    }

    fn handle_cast(&self, server: &Server<Self>, msg: M, state: &S) -> Option<Handled<R, S>> {
        self.cast_fn.as_ref().and_then(|f| f(server, msg, state))
    }

    fn after_init(&self, server: &Server<Self>, state: &S) {
        if let Some(hook) = &self.init_fn {
            hook(server, state);
        }
    }
}

impl<M, R, S> fmt::Debug for SimpleServer<M, R, S>
where
    M: Send + 'static,
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleServer")
            .field("call_fn", &self.call_fn.is_some())
            .field("cast_fn", &self.cast_fn.is_some())
            .field("init_fn", &self.init_fn.is_some())
            .finish()
    }
}
