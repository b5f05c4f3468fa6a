//! Error types for the signaling control plane

/// Result type alias using the peerconnect Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling, peer and control operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signal channel connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling command with missing or malformed fields
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A live peer already exists for this remote id
    #[error("Peer already exists: {0}")]
    PeerExists(String),

    /// Local half-channel is not open
    #[error("Channel not open: {0}")]
    ChannelNotOpen(String),

    /// Send refused because the buffered-bytes cap is reached
    #[error("Send buffer full: {buffered} bytes buffered (limit {limit})")]
    BufferFull {
        /// Bytes currently buffered
        buffered: u64,
        /// Configured cap
        limit: u64,
    },

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Blocking call attempted on the owning context
    #[error("Blocking call on the owning context: {0}")]
    OwningContext(String),

    /// The control loop is no longer running
    #[error("Control stopped")]
    ControlStopped,

    /// Connection engine failed to initialize or operate
    #[error("Engine error: {0}")]
    EngineError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is recovered by reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a send capacity failure
    ///
    /// Capacity errors leave the peer untouched; the caller may retry later.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Error::BufferFull { .. } | Error::OperationTimeout(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerExists(_)
                | Error::ChannelNotOpen(_)
                | Error::EngineError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
