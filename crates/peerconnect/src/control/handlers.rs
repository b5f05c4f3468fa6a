//! Inbound signaling command handlers
//!
//! One handler per command. A handler that returns an error leaves all
//! state untouched; the error is logged and the command dropped.

use super::{Control, ControlEvent};
use crate::signal::protocol::{
    ChannelLeft, ChannelReply, CreateOfferRequest, SessionDescription, SignInReply,
};
use crate::signal::{CommandKind, IceCandidate, SignalingCommand};
use crate::{Error, Result};
use tracing::{debug, info, warn};

const UNKNOWN_REASON: &str = "Unknown reason";

impl Control {
    /// Dispatch a command received from the signaling server
    pub(super) fn on_command(&mut self, command: SignalingCommand) {
        let Some(kind) = CommandKind::parse(&command.command) else {
            debug!(command = %command.command, "Ignoring unrecognized command");
            return;
        };

        let result = match kind {
            CommandKind::SignIn => self.on_signed_in(&command),
            CommandKind::ChannelCreated => self.on_channel_created(&command),
            CommandKind::ChannelJoined => self.on_channel_joined(&command),
            CommandKind::ChannelLeft => self.on_channel_left(&command),
            CommandKind::CreateOffer => self.on_create_offer(&command),
            CommandKind::OfferSdp => self.on_offer_sdp(&command),
            CommandKind::AnswerSdp => self.on_answer_sdp(&command),
            CommandKind::IceCandidate => self.on_ice_candidate(&command),
            CommandKind::ClosePeerConnection => self.on_close_peer_connection(&command),
        };

        if let Err(e) = result {
            warn!(command = %command.command, peer_id = ?command.peer_id, "Dropping command: {}", e);
        }
    }

    fn on_signed_in(&mut self, command: &SignalingCommand) -> Result<()> {
        let reply: SignInReply = command.payload()?;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::ProtocolError("signin reply without a session".to_string()));
        };

        if !reply.result {
            let user_id = session.credentials.user_id.clone();
            self.emit_error(&user_id, "Sign in rejected");
            return Ok(());
        }

        let session_id = reply
            .session_id
            .ok_or_else(|| Error::ProtocolError("signin reply without session_id".to_string()))?;

        info!(%session_id, alias = %session.alias, "Signed in, creating channel");
        session.session_id = Some(session_id);
        let create = SignalingCommand::create_channel(&session.alias);
        self.signal.send_command(&create);
        Ok(())
    }

    fn on_channel_created(&mut self, command: &SignalingCommand) -> Result<()> {
        let reply: ChannelReply = command.payload()?;
        if !reply.result {
            let reason = reply.reason.as_deref().unwrap_or(UNKNOWN_REASON);
            self.emit_error(&reply.name, reason);
            return Ok(());
        }

        info!(channel = %reply.name, "Channel created");
        self.observers.emit(ControlEvent::SignedIn(reply.name));
        Ok(())
    }

    fn on_channel_joined(&mut self, command: &SignalingCommand) -> Result<()> {
        let reply: ChannelReply = command.payload()?;
        if !reply.result {
            let reason = reply.reason.as_deref().unwrap_or(UNKNOWN_REASON);
            self.emit_error(&reply.name, reason);
            return Ok(());
        }

        info!(channel = %reply.name, "Channel joined");
        Ok(())
    }

    fn on_channel_left(&mut self, command: &SignalingCommand) -> Result<()> {
        let left: ChannelLeft = command.payload()?;
        debug!(channel = %left.name, "Channel left");
        Ok(())
    }

    fn on_create_offer(&mut self, command: &SignalingCommand) -> Result<()> {
        let request: CreateOfferRequest = command.payload()?;

        for remote_id in request.peers {
            if remote_id.is_empty() {
                warn!("Skipping empty peer id in createoffer");
                continue;
            }
            if self.peers.contains(&remote_id) {
                warn!(peer_id = %remote_id, "Peer already exists, skipping offer");
                continue;
            }

            match self.create_peer(&remote_id) {
                Ok(_) => {
                    if let Some(peer) = self.peers.get(&remote_id) {
                        peer.create_offer();
                    }
                }
                Err(e) => self.emit_error(&remote_id, e.to_string()),
            }
        }
        Ok(())
    }

    fn on_offer_sdp(&mut self, command: &SignalingCommand) -> Result<()> {
        let remote_id = command.require_peer_id()?.to_string();
        let offer: SessionDescription = command.payload()?;

        if !self.peers.contains(&remote_id) {
            if let Err(e) = self.create_peer(&remote_id) {
                self.emit_error(&remote_id, e.to_string());
                return Ok(());
            }
        } else {
            debug!(peer_id = %remote_id, "Offer for existing peer");
        }

        if let Some(peer) = self.peers.get(&remote_id) {
            peer.receive_offer_sdp(&offer.sdp);
        }
        Ok(())
    }

    fn on_answer_sdp(&mut self, command: &SignalingCommand) -> Result<()> {
        let remote_id = command.require_peer_id()?;
        let answer: SessionDescription = command.payload()?;

        let peer = self
            .peers
            .get(remote_id)
            .ok_or_else(|| Error::PeerNotFound(remote_id.to_string()))?;
        peer.receive_answer_sdp(&answer.sdp);
        Ok(())
    }

    fn on_ice_candidate(&mut self, command: &SignalingCommand) -> Result<()> {
        let remote_id = command.require_peer_id()?;
        let candidate: IceCandidate = command.payload()?;

        let peer = self
            .peers
            .get(remote_id)
            .ok_or_else(|| Error::PeerNotFound(remote_id.to_string()))?;
        peer.add_ice_candidate(candidate);
        Ok(())
    }

    fn on_close_peer_connection(&mut self, command: &SignalingCommand) -> Result<()> {
        let remote_id = command.require_peer_id()?;
        let generation = self
            .peers
            .get(remote_id)
            .map(|peer| peer.generation())
            .ok_or_else(|| Error::PeerNotFound(remote_id.to_string()))?;

        info!(peer_id = remote_id, "Server closed peer connection");
        self.finalize_peer(remote_id, generation);
        Ok(())
    }
}
