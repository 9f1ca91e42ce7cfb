//! In-process typed publish/subscribe.
//!
//! Observer wiring between adapter components goes through [`Signal`]
//! values: a publisher owns the signal, subscribers register plain
//! closures and receive every emission synchronously, in registration
//! order. Handlers must be non-blocking; anything slow belongs on a
//! channel bridged from the handler.
//!
//! Subscriptions are explicit and so is their teardown: [`Signal::connect`]
//! returns a [`HandlerToken`] that the subscriber must pass back to
//! [`Signal::disconnect`] when its interest ends, otherwise the closure
//! (and whatever it captures) lives as long as the signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque identity of one connected handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerToken(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A typed broadcast point with synchronous dispatch.
pub struct Signal<T> {
    handlers: Mutex<Vec<(HandlerToken, Handler<T>)>>,
    next_token: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Registers a handler, appending it after all existing ones.
    pub fn connect(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerToken {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .expect("signal handler list poisoned")
            .push((token, Arc::new(handler)));
        token
    }

    /// Removes a previously connected handler.
    ///
    /// Returns false when the token was never connected or was already
    /// disconnected; callers treat that as a wiring bug.
    pub fn disconnect(&self, token: HandlerToken) -> bool {
        let mut handlers = self.handlers.lock().expect("signal handler list poisoned");
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != token);
        handlers.len() != before
    }

    /// Emits a payload to every connected handler, in registration order.
    ///
    /// The handler list is snapshotted first, so handlers may connect and
    /// disconnect (even themselves) while an emission is in flight.
    pub fn send(&self, payload: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .expect("signal handler list poisoned")
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(payload);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
