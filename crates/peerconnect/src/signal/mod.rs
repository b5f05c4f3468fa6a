//! Signal channel: persistent connection to the signaling server
//!
//! - [`protocol`]: command envelope, payloads and close codes
//! - [`backoff`]: reconnect delay schedule
//! - [`connector`]: transport capability and the WebSocket transport
//! - [`memory`]: in-process transport
//! - [`channel`]: the reconnecting client itself

pub mod backoff;
pub mod channel;
pub mod connector;
pub mod memory;
pub mod protocol;

pub use backoff::ReconnectPolicy;
pub use channel::{
    SignalChannel, SignalEvent, SignalObserver, SignalState, SignalStatus, SignalTransport,
};
pub use connector::{Frame, SignalConnector, SignalLink, WebSocketConnector};
pub use memory::{memory_transport, MemoryConnector, MemoryListener, MemoryServerLink};
pub use protocol::{CloseCode, CommandKind, IceCandidate, SignalingCommand};
