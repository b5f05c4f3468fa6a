//! Signaling control plane for direct peer data channels
//!
//! This crate connects to a signaling server, negotiates peer-to-peer
//! data channels with the peers it is told about, and reports lifecycle
//! events to registered observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  ControlHandle (any thread)                          │
//! │  ↓ Task queue                                         │
//! │  Control (owning context, dedicated thread)          │
//! │  ├─ SignalChannel (reconnecting WebSocket client)   │
//! │  │   └─ own I/O thread, backoff between attempts     │
//! │  ├─ PeerTable (remote id → Peer, generation tokens) │
//! │  │   └─ Peer: local + remote half-channels          │
//! │  └─ Observers (weak, notified on the owning thread) │
//! │     ↑ EngineEvents                                    │
//! │  ConnectionEngine (webrtc peer connection per peer)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! All mutable state is owned by the control loop. Signal and engine
//! callbacks arrive on other threads and are posted back to it as tasks.
//!
//! # Example
//!
//! ```
//! use peerconnect::PeerConnectConfig;
//!
//! let config = PeerConnectConfig::default()
//!     .with_signal_url("wss://signal.example.com")
//!     .with_max_buffered_bytes(1024 * 1024);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.peer.channel_label("bob"), "pc_data_bob");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peerconnect::{
//!     ChannelObserver, Control, ControlEvent, PeerConnectConfig, WebRtcEngineFactory,
//!     WebSocketConnector,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> peerconnect::Result<()> {
//! let config = PeerConnectConfig::default().with_signal_url("ws://localhost:8080");
//! let engines = Arc::new(WebRtcEngineFactory::new(config.engine.clone())?);
//! let (observer, mut events) = ChannelObserver::new();
//!
//! let control = Control::spawn(config, Arc::new(WebSocketConnector::new()), engines, &observer)?;
//! control.sign_in("alice", "secret", "alice");
//!
//! while let Some(event) = events.recv().await {
//!     if let ControlEvent::SignedIn(channel) = event {
//!         println!("reachable as {}", channel);
//!         control.connect("bob");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod peer;
pub mod queue;
pub mod signal;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    Credentials, EngineConfig, PeerConfig, PeerConnectConfig, SignalConfig, TurnServerConfig,
};
pub use control::{
    ChannelObserver, Control, ControlEvent, ControlHandle, ControlObserver, ControlStatus,
    PeerStatus,
};
pub use engine::{
    ChannelSide, ConnectionEngine, EngineEvent, EngineEventSink, EngineFactory, EngineSpec,
    WebRtcEngineFactory,
};
pub use error::{Error, Result};
pub use peer::{ChannelState, PeerState, PeerWriter};
pub use signal::{
    memory_transport, CloseCode, IceCandidate, MemoryConnector, ReconnectPolicy, SignalConnector,
    SignalState, SignalingCommand, WebSocketConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
