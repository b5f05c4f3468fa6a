//! Connection engine capability
//!
//! The engine performs the actual peer-to-peer handshake and owns the byte
//! channel. The control plane drives it through [`ConnectionEngine`]
//! requests and learns about progress through [`EngineEvent`]s delivered to
//! an [`EngineEventSink`]. Requests never block; results come back as
//! events, possibly on a foreign thread.

pub mod rtc;

use crate::peer::BufferGauge;
use crate::signal::IceCandidate;
use crate::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub use rtc::WebRtcEngineFactory;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Which end of a peer's data path an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// Channel created by this side; carries outbound data
    Local,
    /// Channel created by the remote side
    Remote,
}

/// Connectivity state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Progress reported by a connection engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A locally generated description is ready to be applied and sent
    LocalDescriptionReady { kind: SdpKind, sdp: String },
    /// A local connectivity candidate was gathered
    CandidateReady(IceCandidate),
    /// A data channel exists for this side
    ChannelAttached(ChannelSide),
    ChannelOpen(ChannelSide),
    ChannelClosed(ChannelSide),
    ConnectionStateChanged(EngineConnectionState),
    /// Bytes received from the remote side
    Message(Bytes),
    /// Bytes queued on the local channel and not yet handed to the network
    BufferedAmountChanged(u64),
    /// The engine is done with one queued write of `bytes`, whether or not
    /// the channel accepted it; `buffered` is the channel's amount afterwards
    SendCompleted { bytes: u64, buffered: u64 },
    /// The engine cannot continue
    Failed(String),
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// One peer connection inside the engine
pub trait ConnectionEngine: Send + Sync {
    fn create_offer(&self);
    fn create_answer(&self);
    fn set_local_description(&self, kind: SdpKind, sdp: String);
    fn set_remote_description(&self, kind: SdpKind, sdp: String);
    fn add_candidate(&self, candidate: IceCandidate);

    /// Queue bytes on the local channel
    fn send(&self, data: Bytes) -> Result<()>;

    /// Close both data channels, keeping the connection
    fn close_channels(&self);

    /// Release the connection
    fn close(&self);
}

/// What a new engine instance is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub local_id: String,
    pub remote_id: String,
    /// Label for the local data channel
    pub channel_label: String,
}

/// Creates one engine per peer
pub trait EngineFactory: Send + Sync {
    fn create(&self, spec: EngineSpec, events: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>>;
}

/// Where an engine reports its events
///
/// Updates the local channel's buffer gauge in place, since blocking
/// senders wait on it, then hands the event to the owning context.
#[derive(Clone)]
pub struct EngineEventSink {
    gauge: Arc<BufferGauge>,
    deliver: Arc<dyn Fn(EngineEvent) + Send + Sync>,
}

impl EngineEventSink {
    pub fn new(
        gauge: Arc<BufferGauge>,
        deliver: impl Fn(EngineEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            gauge,
            deliver: Arc::new(deliver),
        }
    }

    /// Report an event
    pub fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::BufferedAmountChanged(amount) => self.gauge.set(*amount),
            EngineEvent::SendCompleted { bytes, buffered } => {
                self.gauge.complete(*bytes, *buffered)
            }
            EngineEvent::ChannelOpen(ChannelSide::Local) => self.gauge.set_open(true),
            EngineEvent::ChannelClosed(ChannelSide::Local) | EngineEvent::Failed(_) => {
                self.gauge.set_open(false)
            }
            _ => {}
        }
        (self.deliver)(event);
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("gauge", &self.gauge)
            .finish_non_exhaustive()
    }
}
