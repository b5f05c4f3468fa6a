//! Peer state machine
//!
//! ```text
//! Connecting --(local & remote half-channel open)--> Open
//! Connecting --(engine closed)--------------------> Closed
//! Open       --(engine disconnected)--------------> Closing
//! Open       --(engine closed)--------------------> Closed
//! Closing    --(both half-channels closed)--------> Closed
//! ```
//!
//! A peer never acts on the control plane directly. Engine events are fed
//! in on the owning context and come back out as [`PeerNotice`]s for the
//! control loop to act on.

use super::channel::{BufferGauge, ChannelState, HalfChannel, PeerWriter};
use super::table::Generation;
use crate::engine::{ChannelSide, ConnectionEngine, EngineConnectionState, EngineEvent, SdpKind};
use crate::signal::{IceCandidate, SignalingCommand};
use crate::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What a peer needs the control loop to do after an engine event
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotice {
    /// Send this command over the signal channel
    Signal(SignalingCommand),
    /// Both half-channels are open
    Connected,
    /// The local half-channel can take more data
    Writable,
    Message(Bytes),
    /// The engine dropped unexpectedly; leave the channel and tear down
    DisconnectRequested,
    /// Both half-channels are closed; reclaim after the grace period
    ChannelsClosed,
    /// The engine connection is gone; reclaim now
    ConnectionClosed,
    /// The engine cannot continue
    Failed(String),
}

/// One remote counterpart
pub struct Peer {
    local_id: String,
    remote_id: String,
    generation: Generation,
    state: PeerState,
    local: HalfChannel,
    remote: HalfChannel,
    engine: Arc<dyn ConnectionEngine>,
    writer: PeerWriter,
    gauge: Arc<BufferGauge>,
    close_requested: bool,
    disconnect_requested: bool,
    channels_closed_reported: bool,
    connection_closed: bool,
}

impl Peer {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        generation: Generation,
        engine: Arc<dyn ConnectionEngine>,
        gauge: Arc<BufferGauge>,
        max_buffered_bytes: u64,
    ) -> Self {
        let remote_id = remote_id.into();
        let writer = PeerWriter::new(
            remote_id.clone(),
            Arc::clone(&engine),
            Arc::clone(&gauge),
            max_buffered_bytes,
        );

        Self {
            local_id: local_id.into(),
            remote_id,
            generation,
            state: PeerState::Connecting,
            local: HalfChannel::local(),
            remote: HalfChannel::remote(),
            engine,
            writer,
            gauge,
            close_requested: false,
            disconnect_requested: false,
            channels_closed_reported: false,
            connection_closed: false,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn channel_state(&self, side: ChannelSide) -> ChannelState {
        self.channel(side).state()
    }

    pub fn buffered_amount(&self) -> u64 {
        self.gauge.buffered()
    }

    pub fn is_open(&self) -> bool {
        self.state == PeerState::Open
    }

    /// Ask the engine for an offer
    pub fn create_offer(&self) {
        debug!(peer_id = %self.remote_id, "Creating offer");
        self.engine.create_offer();
    }

    /// Apply a remote offer and ask the engine for an answer
    pub fn receive_offer_sdp(&self, sdp: &str) {
        debug!(peer_id = %self.remote_id, "Received offer");
        self.engine
            .set_remote_description(SdpKind::Offer, sdp.to_string());
        self.engine.create_answer();
    }

    /// Apply the remote answer
    pub fn receive_answer_sdp(&self, sdp: &str) {
        debug!(peer_id = %self.remote_id, "Received answer");
        self.engine
            .set_remote_description(SdpKind::Answer, sdp.to_string());
    }

    pub fn add_ice_candidate(&self, candidate: IceCandidate) {
        trace!(peer_id = %self.remote_id, candidate = %candidate.candidate, "Adding remote candidate");
        self.engine.add_candidate(candidate);
    }

    /// Queue `data` on the local half-channel without waiting
    pub fn send(&self, data: Bytes) -> Result<()> {
        if !self.local.is_open() {
            return Err(crate::Error::ChannelNotOpen(self.remote_id.clone()));
        }
        self.writer.send(data)
    }

    /// Write handle for blocking sends from other contexts
    pub fn writer(&self) -> PeerWriter {
        self.writer.clone()
    }

    /// Request both half-channels to close
    ///
    /// Returns false if a close was already requested.
    pub fn close(&mut self) -> bool {
        if self.close_requested {
            return false;
        }
        self.close_requested = true;

        info!(peer_id = %self.remote_id, "Closing peer");
        if self.state != PeerState::Closed {
            self.set_state(PeerState::Closing);
        }
        self.gauge.set_open(false);
        self.engine.close_channels();
        true
    }

    /// Release the engine connection
    pub fn close_connection(&mut self) {
        if self.connection_closed {
            return;
        }
        self.connection_closed = true;
        self.gauge.set_open(false);
        self.engine.close();
        self.set_state(PeerState::Closed);
    }

    /// Apply an engine event
    pub fn handle_engine_event(&mut self, event: EngineEvent) -> Vec<PeerNotice> {
        let mut notices = Vec::new();

        match event {
            EngineEvent::LocalDescriptionReady { kind, sdp } => {
                self.engine.set_local_description(kind, sdp.clone());
                let command = match kind {
                    SdpKind::Offer => SignalingCommand::offer_sdp(&self.remote_id, &sdp),
                    SdpKind::Answer => SignalingCommand::answer_sdp(&self.remote_id, &sdp),
                };
                notices.push(PeerNotice::Signal(command));
            }
            EngineEvent::CandidateReady(candidate) => {
                notices.push(PeerNotice::Signal(SignalingCommand::ice_candidate(
                    &self.remote_id,
                    &candidate,
                )));
            }
            EngineEvent::ChannelAttached(side) => {
                if self.channel(side).state() == ChannelState::Unattached {
                    self.channel_mut(side).transition(ChannelState::Connecting);
                }
            }
            EngineEvent::ChannelOpen(side) => {
                if self.channel_mut(side).transition(ChannelState::Open) {
                    self.on_channel_open(&mut notices);
                }
            }
            EngineEvent::ChannelClosed(side) => {
                if self.channel_mut(side).transition(ChannelState::Closed) {
                    self.on_channel_closed(&mut notices);
                }
            }
            EngineEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(state, &mut notices);
            }
            EngineEvent::Message(data) => {
                trace!(peer_id = %self.remote_id, bytes = data.len(), "Message received");
                notices.push(PeerNotice::Message(data));
            }
            EngineEvent::BufferedAmountChanged(amount) => {
                if amount == 0 {
                    self.on_drained(&mut notices);
                }
            }
            EngineEvent::SendCompleted { buffered, .. } => {
                if buffered == 0 && self.gauge.buffered() == 0 {
                    self.on_drained(&mut notices);
                }
            }
            EngineEvent::Failed(reason) => {
                error!(peer_id = %self.remote_id, "Connection engine failed: {}", reason);
                self.set_state(PeerState::Closed);
                notices.push(PeerNotice::Failed(reason));
            }
        }

        notices
    }

    fn on_drained(&self, notices: &mut Vec<PeerNotice>) {
        if self.state == PeerState::Open && self.local.is_open() {
            notices.push(PeerNotice::Writable);
        }
    }

    fn on_channel_open(&mut self, notices: &mut Vec<PeerNotice>) {
        if self.state == PeerState::Connecting && self.local.is_open() && self.remote.is_open() {
            self.set_state(PeerState::Open);
            notices.push(PeerNotice::Connected);
            notices.push(PeerNotice::Writable);
        }
    }

    fn on_channel_closed(&mut self, notices: &mut Vec<PeerNotice>) {
        if self.channels_closed_reported || !(self.local.is_closed() && self.remote.is_closed()) {
            return;
        }
        self.channels_closed_reported = true;
        self.set_state(PeerState::Closed);
        notices.push(PeerNotice::ChannelsClosed);
    }

    fn on_connection_state(&mut self, state: EngineConnectionState, notices: &mut Vec<PeerNotice>) {
        debug!(peer_id = %self.remote_id, ?state, "Engine connection state changed");

        match state {
            EngineConnectionState::Disconnected | EngineConnectionState::Failed => {
                if self.disconnect_requested
                    || !matches!(self.state, PeerState::Connecting | PeerState::Open)
                {
                    return;
                }
                warn!(peer_id = %self.remote_id, ?state, "Peer connection dropped");
                self.disconnect_requested = true;
                self.set_state(PeerState::Closing);
                notices.push(PeerNotice::DisconnectRequested);
            }
            EngineConnectionState::Closed => {
                if self.connection_closed {
                    return;
                }
                self.connection_closed = true;
                self.gauge.set_open(false);
                self.set_state(PeerState::Closed);
                notices.push(PeerNotice::ConnectionClosed);
            }
            _ => {}
        }
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state != state {
            debug!(peer_id = %self.remote_id, from = ?self.state, to = ?state, "Peer transition");
            self.state = state;
        }
    }

    fn channel(&self, side: ChannelSide) -> &HalfChannel {
        match side {
            ChannelSide::Local => &self.local,
            ChannelSide::Remote => &self.remote,
        }
    }

    fn channel_mut(&mut self, side: ChannelSide) -> &mut HalfChannel {
        match side {
            ChannelSide::Local => &mut self.local,
            ChannelSide::Remote => &mut self.remote,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("local", &self.local.state())
            .field("remote", &self.remote.state())
            .field("buffered", &self.gauge.buffered())
            .finish()
    }
}
