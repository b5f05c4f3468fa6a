//! Peer connection management
//!
//! Handles the per-remote state machine, its two half-channels and the
//! table the control loop keeps them in.

pub mod channel;
pub mod connection;
pub mod table;

pub use channel::{BufferGauge, ChannelState, HalfChannel, PeerWriter};
pub use connection::{Peer, PeerNotice, PeerState};
pub use table::{Generation, PeerTable};
