//! Signaling command protocol
//!
//! Every message on the signal channel is one JSON envelope:
//!
//! ```text
//! { "command": <string>, "peer_id": <string, optional>, "data": { ... } }
//! ```

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Command names carried in the `command` field
pub mod commands {
    pub const SIGNIN: &str = "signin";
    pub const CREATE_CHANNEL: &str = "createchannel";
    pub const CHANNEL_CREATED: &str = "channelcreated";
    pub const JOIN_CHANNEL: &str = "joinchannel";
    pub const CHANNEL_JOINED: &str = "channeljoined";
    pub const LEAVE_CHANNEL: &str = "leavechannel";
    pub const CHANNEL_LEAVED: &str = "channelleaved";
    pub const CREATE_OFFER: &str = "createoffer";
    pub const OFFER_SDP: &str = "offersdp";
    pub const ANSWER_SDP: &str = "answersdp";
    pub const ICE_CANDIDATE: &str = "ice_candidate";
    pub const CLOSE_PEERCONNECTION: &str = "close_peerconnection";
}

/// Inbound commands the control plane reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SignIn,
    ChannelCreated,
    ChannelJoined,
    ChannelLeft,
    CreateOffer,
    OfferSdp,
    AnswerSdp,
    IceCandidate,
    ClosePeerConnection,
}

impl CommandKind {
    /// Map a wire command name to its kind; unknown names yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            commands::SIGNIN => Self::SignIn,
            commands::CHANNEL_CREATED => Self::ChannelCreated,
            commands::CHANNEL_JOINED => Self::ChannelJoined,
            commands::CHANNEL_LEAVED => Self::ChannelLeft,
            commands::CREATE_OFFER => Self::CreateOffer,
            commands::OFFER_SDP => Self::OfferSdp,
            commands::ANSWER_SDP => Self::AnswerSdp,
            commands::ICE_CANDIDATE => Self::IceCandidate,
            commands::CLOSE_PEERCONNECTION => Self::ClosePeerConnection,
            _ => return None,
        };
        Some(kind)
    }
}

/// Signaling command envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingCommand {
    /// Command name
    pub command: String,

    /// Remote peer (or channel) the command concerns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    /// Command payload
    #[serde(default)]
    pub data: Value,
}

impl SignalingCommand {
    /// Create a command without a target peer
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            peer_id: None,
            data,
        }
    }

    /// Address the command to a peer or channel
    pub fn with_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Convert command to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling command: {}", e))
        })
    }

    /// Parse command from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to parse signaling command: {}", e))
        })
    }

    /// Decode the `data` field into a typed payload
    ///
    /// Missing or mistyped fields are protocol errors.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| {
            Error::ProtocolError(format!("{} payload: {}", self.command, e))
        })
    }

    /// The `peer_id` field, required by peer-scoped commands
    pub fn require_peer_id(&self) -> Result<&str> {
        self.peer_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::ProtocolError(format!("{} without peer_id", self.command)))
    }

    /// `signin` request
    pub fn sign_in(user_id: &str, user_password: &str) -> Self {
        Self::new(
            commands::SIGNIN,
            json!({ "user_id": user_id, "user_password": user_password }),
        )
    }

    /// `createchannel` request
    pub fn create_channel(name: &str) -> Self {
        Self::channel_request(commands::CREATE_CHANNEL, name)
    }

    /// `joinchannel` request
    pub fn join_channel(name: &str) -> Self {
        Self::channel_request(commands::JOIN_CHANNEL, name)
    }

    /// `leavechannel` request
    pub fn leave_channel(name: &str) -> Self {
        Self::channel_request(commands::LEAVE_CHANNEL, name)
    }

    fn channel_request(command: &str, name: &str) -> Self {
        Self::new(command, json!({ "name": name })).with_peer(name)
    }

    /// `offersdp` to a remote peer
    pub fn offer_sdp(remote_id: &str, sdp: &str) -> Self {
        Self::new(commands::OFFER_SDP, json!({ "sdp": sdp })).with_peer(remote_id)
    }

    /// `answersdp` to a remote peer
    pub fn answer_sdp(remote_id: &str, sdp: &str) -> Self {
        Self::new(commands::ANSWER_SDP, json!({ "sdp": sdp })).with_peer(remote_id)
    }

    /// `ice_candidate` to a remote peer
    pub fn ice_candidate(remote_id: &str, candidate: &IceCandidate) -> Self {
        Self::new(
            commands::ICE_CANDIDATE,
            json!({
                "sdp_mid": candidate.sdp_mid,
                "sdp_mline_index": candidate.sdp_mline_index,
                "candidate": candidate.candidate,
            }),
        )
        .with_peer(remote_id)
    }
}

/// `signin` reply payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignInReply {
    pub result: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `channelcreated` / `channeljoined` reply payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelReply {
    pub name: String,
    pub result: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `channelleaved` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelLeft {
    pub name: String,
}

/// `createoffer` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateOfferRequest {
    pub peers: Vec<String>,
}

/// `offersdp` / `answersdp` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// Connectivity candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag
    pub sdp_mid: String,

    /// Index of the m-line the candidate belongs to
    pub sdp_mline_index: u16,

    /// Candidate attribute line
    pub candidate: String,
}

/// Status with which the signal connection closed
///
/// Only `Normal` means the close was requested; every other code makes the
/// signal channel reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCode {
    Normal,
    GoingAway,
    Abnormal,
    ProtocolError,
    SignalError,
}

impl CloseCode {
    pub fn is_normal(self) -> bool {
        self == CloseCode::Normal
    }

    /// RFC 6455 status code sent in a close frame
    ///
    /// 1006 may not appear on the wire, so `Abnormal` goes out as 1011.
    pub fn to_ws_code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Abnormal => 1011,
            CloseCode::SignalError => 4000,
        }
    }

    /// Map a received RFC 6455 status code
    pub fn from_ws_code(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 | 1003 | 1007 | 1009 | 1010 => CloseCode::ProtocolError,
            4000..=4999 => CloseCode::SignalError,
            _ => CloseCode::Abnormal,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "normal",
            CloseCode::GoingAway => "going_away",
            CloseCode::Abnormal => "abnormal",
            CloseCode::ProtocolError => "protocol_error",
            CloseCode::SignalError => "signal_error",
        };
        f.write_str(name)
    }
}
