//! Work items for the control loop

use super::observer::ControlObserver;
use super::ControlStatus;
use crate::config::Credentials;
use crate::engine::EngineEvent;
use crate::peer::{Generation, PeerWriter};
use crate::signal::SignalEvent;
use crate::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::Weak;
use tokio::sync::oneshot;

/// One unit of work executed on the owning context
pub enum Task {
    /// Relayed from the signal channel's thread
    Signal(SignalEvent),

    /// Relayed from a peer's connection engine
    Engine {
        remote_id: String,
        generation: Generation,
        event: EngineEvent,
    },

    SignIn {
        credentials: Credentials,
        alias: String,
    },
    SignOut,
    Connect(String),
    Disconnect(String),

    /// Close a peer's half-channels; posted after `leavechannel` went out
    DisconnectPeer {
        remote_id: String,
        generation: Generation,
    },

    /// Release and remove a peer whose half-channels have closed
    ReclaimPeer {
        remote_id: String,
        generation: Generation,
    },

    Send {
        remote_id: String,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        data: Bytes,
        reply: oneshot::Sender<usize>,
    },
    OpenWriter {
        remote_id: String,
        reply: oneshot::Sender<Result<PeerWriter>>,
    },
    Status(oneshot::Sender<ControlStatus>),

    RegisterObserver(Weak<dyn ControlObserver>),
    UnregisterObserver(Weak<dyn ControlObserver>),

    Shutdown,
}

impl From<SignalEvent> for Task {
    fn from(event: SignalEvent) -> Self {
        Task::Signal(event)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Signal(event) => f.debug_tuple("Signal").field(event).finish(),
            Task::Engine {
                remote_id,
                generation,
                event,
            } => f
                .debug_struct("Engine")
                .field("remote_id", remote_id)
                .field("generation", generation)
                .field("event", event)
                .finish(),
            Task::SignIn { credentials, alias } => f
                .debug_struct("SignIn")
                .field("user_id", &credentials.user_id)
                .field("alias", alias)
                .finish(),
            Task::SignOut => f.write_str("SignOut"),
            Task::Connect(id) => f.debug_tuple("Connect").field(id).finish(),
            Task::Disconnect(id) => f.debug_tuple("Disconnect").field(id).finish(),
            Task::DisconnectPeer {
                remote_id,
                generation,
            } => f
                .debug_struct("DisconnectPeer")
                .field("remote_id", remote_id)
                .field("generation", generation)
                .finish(),
            Task::ReclaimPeer {
                remote_id,
                generation,
            } => f
                .debug_struct("ReclaimPeer")
                .field("remote_id", remote_id)
                .field("generation", generation)
                .finish(),
            Task::Send {
                remote_id, data, ..
            } => f
                .debug_struct("Send")
                .field("remote_id", remote_id)
                .field("bytes", &data.len())
                .finish(),
            Task::Broadcast { data, .. } => f
                .debug_struct("Broadcast")
                .field("bytes", &data.len())
                .finish(),
            Task::OpenWriter { remote_id, .. } => f
                .debug_struct("OpenWriter")
                .field("remote_id", remote_id)
                .finish(),
            Task::Status(_) => f.write_str("Status"),
            Task::RegisterObserver(_) => f.write_str("RegisterObserver"),
            Task::UnregisterObserver(_) => f.write_str("UnregisterObserver"),
            Task::Shutdown => f.write_str("Shutdown"),
        }
    }
}
