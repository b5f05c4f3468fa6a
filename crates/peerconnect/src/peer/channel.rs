//! Half-channels and the shared buffered-amount gauge

use crate::engine::{ChannelSide, ConnectionEngine};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// State of one half-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No engine channel exists for this side yet
    Unattached,
    Connecting,
    Open,
    Closed,
}

/// One directional endpoint of a peer's byte transport
///
/// Only touched on the owning context.
#[derive(Debug, Clone)]
pub struct HalfChannel {
    side: ChannelSide,
    state: ChannelState,
}

impl HalfChannel {
    /// Local half-channel; created together with the engine
    pub fn local() -> Self {
        Self {
            side: ChannelSide::Local,
            state: ChannelState::Connecting,
        }
    }

    /// Remote half-channel; attached once the remote side opens its channel
    pub fn remote() -> Self {
        Self {
            side: ChannelSide::Remote,
            state: ChannelState::Unattached,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Closed, or never attached
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ChannelState::Closed | ChannelState::Unattached)
    }

    /// Move to `state`; returns false if nothing changed
    ///
    /// A closed half-channel stays closed.
    pub fn transition(&mut self, state: ChannelState) -> bool {
        if self.state == state || self.state == ChannelState::Closed {
            return false;
        }
        debug!(side = ?self.side, from = ?self.state, to = ?state, "Half-channel transition");
        self.state = state;
        true
    }
}

#[derive(Debug, Default)]
struct GaugeState {
    /// Bytes handed to the engine that it has not written to the channel yet
    pending: u64,
    /// Amount the channel last reported as buffered
    reported: u64,
    open: bool,
}

impl GaugeState {
    fn buffered(&self) -> u64 {
        self.pending.saturating_add(self.reported)
    }
}

/// Bytes queued on the local half-channel
///
/// The one resource shared across contexts: the engine updates it from its
/// own thread, blocking senders wait on it from theirs. Writes still queued
/// ahead of the channel are counted apart from what the channel reports, so
/// a report that predates a write cannot clear it.
#[derive(Default)]
pub struct BufferGauge {
    state: Mutex<GaugeState>,
    changed: Condvar,
}

impl BufferGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes pending in the engine plus bytes buffered by the channel
    pub fn buffered(&self) -> u64 {
        self.state.lock().buffered()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Record the amount the channel reports as buffered
    pub fn set(&self, amount: u64) {
        let mut state = self.state.lock();
        state.reported = amount;
        self.notify_if_drained(&state);
    }

    /// Account for bytes just handed to the engine
    pub fn add(&self, amount: u64) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_add(amount);
    }

    /// Undo `add` for bytes the engine refused
    pub fn sub(&self, amount: u64) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(amount);
        self.notify_if_drained(&state);
    }

    /// The engine is done with `bytes` of pending data; `reported` is what
    /// the channel buffers afterwards
    pub fn complete(&self, bytes: u64, reported: u64) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(bytes);
        state.reported = reported;
        self.notify_if_drained(&state);
    }

    /// Mark the local half-channel open or closed; closing wakes every waiter
    pub fn set_open(&self, open: bool) {
        let mut state = self.state.lock();
        state.open = open;
        if !open {
            self.changed.notify_all();
        }
    }

    /// Block until nothing is buffered, the channel closes or `timeout` elapses
    pub fn wait_drained(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        self.changed
            .wait_while_for(&mut state, |s| s.buffered() > 0 && s.open, timeout);

        let buffered = state.buffered();
        if buffered == 0 {
            Ok(())
        } else if !state.open {
            Err(Error::ChannelNotOpen(
                "channel closed while data was buffered".to_string(),
            ))
        } else {
            Err(Error::OperationTimeout(format!(
                "{} bytes still buffered after {:?}",
                buffered, timeout
            )))
        }
    }

    fn notify_if_drained(&self, state: &GaugeState) {
        if state.buffered() == 0 {
            self.changed.notify_all();
        }
    }
}

impl fmt::Debug for BufferGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferGauge")
            .field("pending", &state.pending)
            .field("reported", &state.reported)
            .field("open", &state.open)
            .finish()
    }
}

/// Write handle to a peer's local half-channel
///
/// Safe to hand to any context. Holds the engine and the gauge, never the
/// peer, so it cannot keep a removed peer alive.
#[derive(Clone)]
pub struct PeerWriter {
    remote_id: String,
    engine: Arc<dyn ConnectionEngine>,
    gauge: Arc<BufferGauge>,
    max_buffered_bytes: u64,
}

impl PeerWriter {
    pub fn new(
        remote_id: impl Into<String>,
        engine: Arc<dyn ConnectionEngine>,
        gauge: Arc<BufferGauge>,
        max_buffered_bytes: u64,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            engine,
            gauge,
            max_buffered_bytes,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn buffered_amount(&self) -> u64 {
        self.gauge.buffered()
    }

    /// Queue `data` without waiting
    pub fn send(&self, data: Bytes) -> Result<()> {
        if !self.gauge.is_open() {
            return Err(Error::ChannelNotOpen(self.remote_id.clone()));
        }

        let buffered = self.gauge.buffered();
        if buffered >= self.max_buffered_bytes {
            return Err(Error::BufferFull {
                buffered,
                limit: self.max_buffered_bytes,
            });
        }

        let len = data.len() as u64;
        self.gauge.add(len);
        if let Err(e) = self.engine.send(data) {
            self.gauge.sub(len);
            return Err(e);
        }

        trace!(peer_id = %self.remote_id, bytes = len, "Queued data");
        Ok(())
    }

    /// Queue `data` and block until the engine has flushed everything
    ///
    /// Must not run on the owning context: the drain is reported through it.
    pub fn sync_send(&self, data: Bytes, timeout: Duration) -> Result<()> {
        self.send(data)?;
        self.gauge.wait_drained(timeout).map_err(|e| match e {
            Error::ChannelNotOpen(_) => Error::ChannelNotOpen(self.remote_id.clone()),
            Error::OperationTimeout(reason) => {
                Error::OperationTimeout(format!("sync send to {}: {}", self.remote_id, reason))
            }
            other => other,
        })
    }
}

impl fmt::Debug for PeerWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerWriter")
            .field("remote_id", &self.remote_id)
            .field("gauge", &self.gauge)
            .field("max_buffered_bytes", &self.max_buffered_bytes)
            .finish()
    }
}
