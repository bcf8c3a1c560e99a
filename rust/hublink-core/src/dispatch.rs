//! Method dispatch contract.
//!
//! The engine never inspects how targets bind to code; it only needs a
//! name → callable lookup supplied at construction. Handlers run on spawned
//! tasks, never inline on the receive loop, so a slow handler delays its own
//! caller rather than the whole connection. Handlers must still avoid
//! blocking the thread: the runtime they share is cooperative.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::mpsc;

/// Outcome of a unary handler: a result value, or an error string reported
/// to the caller in its completion.
pub type HandlerResult = Result<Value, String>;

/// Boxed async unary handler.
pub type UnaryHandler =
    Box<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Boxed streaming handler: returns the receiving end of the item sequence.
/// An `Err` item terminates the stream with that error.
pub type StreamHandler = Box<dyn Fn(Vec<Value>) -> mpsc::Receiver<HandlerResult> + Send + Sync>;

/// A callable registered under a target name.
pub enum Handler {
    Unary(UnaryHandler),
    Stream(StreamHandler),
}

/// Name → callable lookup injected into the connection.
pub trait Dispatcher: Send + Sync + 'static {
    /// Resolve `target`, or report it unknown.
    fn resolve(&self, target: &str) -> Option<&Handler>;
}

/// Plain map-backed [`Dispatcher`].
#[derive(Default)]
pub struct DispatchMap {
    handlers: HashMap<String, Handler>,
}

impl DispatchMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler under `target`.
    pub fn handler<F, Fut>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(
            target.into(),
            Handler::Unary(Box::new(move |args| Box::pin(f(args)))),
        );
        self
    }

    /// Register a streaming handler under `target`.
    pub fn stream_handler<F>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> mpsc::Receiver<HandlerResult> + Send + Sync + 'static,
    {
        self.handlers
            .insert(target.into(), Handler::Stream(Box::new(f)));
        self
    }
}

impl Dispatcher for DispatchMap {
    fn resolve(&self, target: &str) -> Option<&Handler> {
        self.handlers.get(target)
    }
}
