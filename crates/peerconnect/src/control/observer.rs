//! Application-facing events

use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Receives control events
///
/// Called on the owning context; implementations must not block. Every
/// method defaults to doing nothing.
#[allow(unused_variables)]
pub trait ControlObserver: Send + Sync {
    /// The session's channel was created; other peers can now reach it
    fn on_signed_in(&self, channel: &str) {}

    /// Sign-out completed: no peers left and the signal channel is closed
    fn on_signed_out(&self, alias: &str) {}

    /// Both half-channels of a peer are open
    fn on_peer_connected(&self, remote_id: &str) {}

    /// A peer was removed from the table
    fn on_peer_disconnected(&self, remote_id: &str) {}

    fn on_peer_message(&self, remote_id: &str, data: Bytes) {}

    /// The peer's send buffer drained
    fn on_peer_writable(&self, remote_id: &str) {}

    /// A sign-in, channel or engine failure
    fn on_error(&self, id: &str, reason: &str) {}
}

/// A control event as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    SignedIn(String),
    SignedOut(String),
    PeerConnected(String),
    PeerDisconnected(String),
    PeerMessage { remote_id: String, data: Bytes },
    PeerWritable(String),
    Error { id: String, reason: String },
}

impl ControlEvent {
    /// Invoke the matching observer method
    pub fn dispatch(&self, observer: &dyn ControlObserver) {
        match self {
            ControlEvent::SignedIn(channel) => observer.on_signed_in(channel),
            ControlEvent::SignedOut(alias) => observer.on_signed_out(alias),
            ControlEvent::PeerConnected(id) => observer.on_peer_connected(id),
            ControlEvent::PeerDisconnected(id) => observer.on_peer_disconnected(id),
            ControlEvent::PeerMessage { remote_id, data } => {
                observer.on_peer_message(remote_id, data.clone())
            }
            ControlEvent::PeerWritable(id) => observer.on_peer_writable(id),
            ControlEvent::Error { id, reason } => observer.on_error(id, reason),
        }
    }
}

/// Registered observers, held weakly
///
/// An observer that has been dropped is skipped and forgotten.
#[derive(Default)]
pub(crate) struct Observers {
    entries: Vec<Weak<dyn ControlObserver>>,
}

impl Observers {
    pub(crate) fn register(&mut self, observer: Weak<dyn ControlObserver>) {
        if self.entries.iter().any(|entry| entry.ptr_eq(&observer)) {
            return;
        }
        self.entries.push(observer);
    }

    pub(crate) fn unregister(&mut self, observer: &Weak<dyn ControlObserver>) {
        self.entries.retain(|entry| !entry.ptr_eq(observer));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn emit(&mut self, event: ControlEvent) {
        trace!(?event, "Dispatching control event");
        self.entries.retain(|entry| match entry.upgrade() {
            Some(observer) => {
                event.dispatch(observer.as_ref());
                true
            }
            None => false,
        });
    }
}

/// Observer that forwards every event into a channel
///
/// For async consumers that would rather `recv().await` than implement
/// [`ControlObserver`].
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: ControlEvent) {
        let _ = self.tx.send(event);
    }
}

impl ControlObserver for ChannelObserver {
    fn on_signed_in(&self, channel: &str) {
        self.forward(ControlEvent::SignedIn(channel.to_string()));
    }

    fn on_signed_out(&self, alias: &str) {
        self.forward(ControlEvent::SignedOut(alias.to_string()));
    }

    fn on_peer_connected(&self, remote_id: &str) {
        self.forward(ControlEvent::PeerConnected(remote_id.to_string()));
    }

    fn on_peer_disconnected(&self, remote_id: &str) {
        self.forward(ControlEvent::PeerDisconnected(remote_id.to_string()));
    }

    fn on_peer_message(&self, remote_id: &str, data: Bytes) {
        self.forward(ControlEvent::PeerMessage {
            remote_id: remote_id.to_string(),
            data,
        });
    }

    fn on_peer_writable(&self, remote_id: &str) {
        self.forward(ControlEvent::PeerWritable(remote_id.to_string()));
    }

    fn on_error(&self, id: &str, reason: &str) {
        self.forward(ControlEvent::Error {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}
