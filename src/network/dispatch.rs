//! Listener dispatch for endpoint events
//!
//! Fans received-packet, sent-packet and error/warning notifications out to
//! subscribers. The three categories are independent; each keeps its
//! subscribers in insertion order with no duplicates. Payloads are handed out
//! as owned immutable copies so no subscriber can mutate a buffer still in
//! flight through the endpoint.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransportError;

/// Subscriber for received-packet or sent-packet notifications
pub trait PacketListener: Send + Sync {
    fn on_packet(&self, payload: Bytes);
}

/// Subscriber for error and warning notifications
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, error: &TransportError);
}

/// Event dispatch boundary owned by an endpoint.
///
/// Never a process-wide singleton: each endpoint carries (or is injected
/// with) its own dispatch instance.
pub struct PacketDispatch {
    received: Mutex<Vec<Arc<dyn PacketListener>>>,
    sent: Mutex<Vec<Arc<dyn PacketListener>>>,
    errors: Mutex<Vec<Arc<dyn ErrorListener>>>,
    initial_context_sent: AtomicBool,
}

impl PacketDispatch {
    pub fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            initial_context_sent: AtomicBool::new(false),
        }
    }

    /// Subscribe to received-packet events. Returns false if the listener is
    /// already subscribed.
    pub fn subscribe_received(&self, listener: Arc<dyn PacketListener>) -> bool {
        subscribe(&self.received, listener)
    }

    pub fn unsubscribe_received(&self, listener: &Arc<dyn PacketListener>) -> bool {
        unsubscribe(&self.received, listener)
    }

    /// Subscribe to sent-packet events. Returns false if the listener is
    /// already subscribed.
    pub fn subscribe_sent(&self, listener: Arc<dyn PacketListener>) -> bool {
        subscribe(&self.sent, listener)
    }

    pub fn unsubscribe_sent(&self, listener: &Arc<dyn PacketListener>) -> bool {
        unsubscribe(&self.sent, listener)
    }

    /// Subscribe to error/warning events. Returns false if the listener is
    /// already subscribed.
    pub fn subscribe_errors(&self, listener: Arc<dyn ErrorListener>) -> bool {
        let mut listeners = self.errors.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn unsubscribe_errors(&self, listener: &Arc<dyn ErrorListener>) -> bool {
        let mut listeners = self.errors.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Notify received-packet subscribers. Each gets its own handle to an
    /// immutable copy of the payload.
    pub fn fire_received(&self, payload: Bytes) {
        // Snapshot before iterating so callbacks may subscribe or
        // unsubscribe on this category without deadlocking.
        let listeners: Vec<_> = self.received.lock().iter().cloned().collect();
        for listener in listeners {
            listener.on_packet(payload.clone());
        }
    }

    /// Notify sent-packet subscribers.
    pub fn fire_sent(&self, payload: Bytes) {
        let listeners: Vec<_> = self.sent.lock().iter().cloned().collect();
        for listener in listeners {
            listener.on_packet(payload.clone());
        }
    }

    /// Notify error/warning subscribers.
    pub fn fire_error(&self, error: &TransportError) {
        let listeners: Vec<_> = self.errors.lock().iter().cloned().collect();
        for listener in listeners {
            listener.on_error(error);
        }
    }

    /// Record that the one-time initial context has been delivered.
    /// Returns false if it had already been delivered.
    pub fn mark_initial_context(&self) -> bool {
        !self.initial_context_sent.swap(true, Ordering::SeqCst)
    }

    pub fn initial_context_sent(&self) -> bool {
        self.initial_context_sent.load(Ordering::SeqCst)
    }

    /// Allow the initial context to be delivered again.
    pub fn reset_initial_context(&self) {
        self.initial_context_sent.store(false, Ordering::SeqCst);
    }

    /// Drop all subscribers. Called during terminal endpoint shutdown.
    pub fn dispose(&self) {
        self.received.lock().clear();
        self.sent.lock().clear();
        self.errors.lock().clear();
    }

    pub fn subscriber_counts(&self) -> (usize, usize, usize) {
        (
            self.received.lock().len(),
            self.sent.lock().len(),
            self.errors.lock().len(),
        )
    }
}

impl Default for PacketDispatch {
    fn default() -> Self {
        Self::new()
    }
}

fn subscribe(list: &Mutex<Vec<Arc<dyn PacketListener>>>, listener: Arc<dyn PacketListener>) -> bool {
    let mut listeners = list.lock();
    if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
        return false;
    }
    listeners.push(listener);
    true
}

fn unsubscribe(list: &Mutex<Vec<Arc<dyn PacketListener>>>, listener: &Arc<dyn PacketListener>) -> bool {
    let mut listeners = list.lock();
    let before = listeners.len();
    listeners.retain(|l| !Arc::ptr_eq(l, listener));
    listeners.len() != before
}
