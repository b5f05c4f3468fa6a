//! Control: session and peer table authority
//!
//! The control loop is the owning context. It is the only place the peer
//! table and the session are touched; the signal channel and every engine
//! report in through the message queue as [`Task`]s.
//!
//! Disconnecting a peer is always two steps: `leavechannel` goes out over
//! signaling first, then a queued [`Task::DisconnectPeer`] closes the
//! half-channels. Once both are closed the peer is reclaimed after the
//! configured grace period.

mod handle;
mod handlers;
mod observer;
mod task;

pub use handle::ControlHandle;
pub use observer::{ChannelObserver, ControlEvent, ControlObserver};
pub use task::Task;

use crate::config::{Credentials, PeerConnectConfig};
use crate::engine::{ChannelSide, EngineEventSink, EngineFactory, EngineSpec};
use crate::peer::{BufferGauge, ChannelState, Generation, Peer, PeerNotice, PeerState, PeerTable};
use crate::queue::{QueueReceiver, QueueSender};
use crate::signal::{CloseCode, SignalEvent, SignalState, SignalTransport, SignalingCommand};
use crate::{Error, Result};
use bytes::Bytes;
use observer::Observers;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Local identity, from sign-in request until sign-out completes
#[derive(Debug, Clone)]
struct Session {
    credentials: Credentials,
    alias: String,
    session_id: Option<String>,
    sign_out_requested: bool,
}

/// Snapshot of a control instance
#[derive(Debug, Clone, PartialEq)]
pub struct ControlStatus {
    pub signal: SignalState,
    pub user_id: Option<String>,
    pub alias: Option<String>,
    pub session_id: Option<String>,
    pub sign_out_requested: bool,
    pub peers: Vec<PeerStatus>,
}

/// Snapshot of one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub remote_id: String,
    pub state: PeerState,
    pub local: ChannelState,
    pub remote: ChannelState,
    pub buffered: u64,
}

/// Signaling control plane
pub struct Control {
    config: PeerConnectConfig,
    signal: Box<dyn SignalTransport>,
    engines: Arc<dyn EngineFactory>,
    queue: QueueSender<Task>,
    peers: PeerTable,
    observers: Observers,
    session: Option<Session>,
    running: bool,
}

impl Control {
    /// Create a control instance around an already started signal transport
    ///
    /// `queue` must be the sending half of the queue later passed to
    /// [`Control::run`].
    pub fn new(
        config: PeerConnectConfig,
        signal: Box<dyn SignalTransport>,
        engines: Arc<dyn EngineFactory>,
        queue: QueueSender<Task>,
    ) -> Self {
        Self {
            config,
            signal,
            engines,
            queue,
            peers: PeerTable::new(),
            observers: Observers::default(),
            session: None,
            running: true,
        }
    }

    /// Run the control loop on the current thread until shutdown
    pub async fn run(mut self, mut tasks: QueueReceiver<Task>) {
        if !tasks.bind_to_current_thread() {
            warn!("Control queue was already bound to another context");
        }
        info!("Control loop started");

        while self.running {
            match tasks.next().await {
                Some(task) => self.handle(task),
                None => break,
            }
        }

        self.teardown();
        info!("Control loop stopped");
    }

    /// Execute one task
    pub fn handle(&mut self, task: Task) {
        if !self.running {
            debug!(?task, "Control stopped, dropping task");
            return;
        }

        match task {
            Task::Signal(event) => self.on_signal_event(event),
            Task::Engine {
                remote_id,
                generation,
                event,
            } => {
                let Some(peer) = self.peers.get_live_mut(&remote_id, generation) else {
                    debug!(peer_id = %remote_id, "Engine event for a removed peer");
                    return;
                };
                let notices = peer.handle_engine_event(event);
                for notice in notices {
                    self.apply_notice(&remote_id, generation, notice);
                }
            }
            Task::SignIn { credentials, alias } => self.sign_in(credentials, alias),
            Task::SignOut => self.sign_out(),
            Task::Connect(remote_id) => self.connect(&remote_id),
            Task::Disconnect(remote_id) => self.disconnect(&remote_id),
            Task::DisconnectPeer {
                remote_id,
                generation,
            } => self.disconnect_peer(&remote_id, generation),
            Task::ReclaimPeer {
                remote_id,
                generation,
            } => self.finalize_peer(&remote_id, generation),
            Task::Send {
                remote_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.send(&remote_id, data));
            }
            Task::Broadcast { data, reply } => {
                let _ = reply.send(self.broadcast(data));
            }
            Task::OpenWriter { remote_id, reply } => {
                let writer = self
                    .peers
                    .get(&remote_id)
                    .map(Peer::writer)
                    .ok_or(Error::PeerNotFound(remote_id));
                let _ = reply.send(writer);
            }
            Task::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Task::RegisterObserver(observer) => self.observers.register(observer),
            Task::UnregisterObserver(observer) => self.observers.unregister(&observer),
            Task::Shutdown => self.running = false,
        }
    }

    /// Start a session: connect the signal channel if needed and send `signin`
    pub fn sign_in(&mut self, credentials: Credentials, alias: String) {
        if matches!(&self.session, Some(session) if session.sign_out_requested) {
            warn!(user_id = %credentials.user_id, "Sign-out in progress, ignoring sign in");
            return;
        }

        info!(user_id = %credentials.user_id, %alias, "Signing in");
        self.session = Some(Session {
            credentials,
            alias,
            session_id: None,
            sign_out_requested: false,
        });

        match self.signal.state() {
            SignalState::Opened => self.send_sign_in(),
            // `signin` goes out once the channel reports open
            _ => self.signal.connect(),
        }
    }

    /// Leave every peer's channel, close the signal channel and finish the
    /// session once both are done
    pub fn sign_out(&mut self) {
        match self.session.as_mut() {
            Some(session) if session.sign_out_requested => {
                debug!("Sign-out already requested");
                return;
            }
            Some(session) => {
                info!(alias = %session.alias, peers = self.peers.len(), "Signing out");
                session.sign_out_requested = true;
            }
            None => warn!("Sign out without a session"),
        }

        for remote_id in self.peers.ids() {
            self.disconnect(&remote_id);
        }
        self.signal.close(CloseCode::Normal);
        self.try_complete_sign_out();
    }

    /// Join the remote peer's channel; the server then starts the offer exchange
    pub fn connect(&mut self, remote_id: &str) {
        info!(peer_id = remote_id, "Joining channel");
        self.signal
            .send_command(&SignalingCommand::join_channel(remote_id));
    }

    /// Leave the remote peer's channel, then tear the peer down
    pub fn disconnect(&mut self, remote_id: &str) {
        info!(peer_id = remote_id, "Leaving channel");
        self.signal
            .send_command(&SignalingCommand::leave_channel(remote_id));

        match self.peers.get(remote_id) {
            Some(peer) => self.queue.post(Task::DisconnectPeer {
                remote_id: remote_id.to_string(),
                generation: peer.generation(),
            }),
            None => debug!(peer_id = remote_id, "No peer to disconnect"),
        }
    }

    /// Queue bytes for a peer
    pub fn send(&self, remote_id: &str, data: Bytes) -> Result<()> {
        self.peers
            .get(remote_id)
            .ok_or_else(|| Error::PeerNotFound(remote_id.to_string()))?
            .send(data)
    }

    /// Queue bytes for every open peer; returns how many accepted them
    pub fn broadcast(&self, data: Bytes) -> usize {
        let mut delivered = 0;
        for peer in self.peers.iter().filter(|peer| peer.is_open()) {
            match peer.send(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer_id = %peer.remote_id(), "Broadcast skipped peer: {}", e),
            }
        }
        delivered
    }

    pub fn status(&self) -> ControlStatus {
        let mut peers: Vec<PeerStatus> = self
            .peers
            .iter()
            .map(|peer| PeerStatus {
                remote_id: peer.remote_id().to_string(),
                state: peer.state(),
                local: peer.channel_state(ChannelSide::Local),
                remote: peer.channel_state(ChannelSide::Remote),
                buffered: peer.buffered_amount(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        ControlStatus {
            signal: self.signal.state(),
            user_id: self
                .session
                .as_ref()
                .map(|session| session.credentials.user_id.clone()),
            alias: self.session.as_ref().map(|session| session.alias.clone()),
            session_id: self
                .session
                .as_ref()
                .and_then(|session| session.session_id.clone()),
            sign_out_requested: self
                .session
                .as_ref()
                .is_some_and(|session| session.sign_out_requested),
            peers,
        }
    }

    fn on_signal_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Opened => {
                let resume = matches!(&self.session, Some(session) if !session.sign_out_requested);
                if resume {
                    self.send_sign_in();
                }
            }
            SignalEvent::Closed(code) if code.is_normal() => {
                info!("Signal channel closed");
                self.try_complete_sign_out();
            }
            SignalEvent::Closed(code) => {
                warn!(%code, "Signal channel dropped");
            }
            SignalEvent::Command(command) => self.on_command(command),
        }
    }

    fn send_sign_in(&mut self) {
        if let Some(session) = &self.session {
            let command = SignalingCommand::sign_in(
                &session.credentials.user_id,
                &session.credentials.user_password,
            );
            self.signal.send_command(&command);
        }
    }

    /// Create a peer and its engine; the entry is in the table on success
    fn create_peer(&mut self, remote_id: &str) -> Result<Generation> {
        if self.peers.contains(remote_id) {
            return Err(Error::PeerExists(remote_id.to_string()));
        }

        let local_id = self
            .session
            .as_ref()
            .map(|session| session.alias.clone())
            .unwrap_or_default();
        let generation = self.peers.next_generation();
        let gauge = Arc::new(BufferGauge::new());

        let events = {
            let queue = self.queue.clone();
            let remote_id = remote_id.to_string();
            EngineEventSink::new(Arc::clone(&gauge), move |event| {
                queue.post(Task::Engine {
                    remote_id: remote_id.clone(),
                    generation,
                    event,
                })
            })
        };

        let spec = EngineSpec {
            local_id: local_id.clone(),
            remote_id: remote_id.to_string(),
            channel_label: self.config.peer.channel_label(remote_id),
        };
        let engine = self.engines.create(spec, events)?;

        let peer = Peer::new(
            local_id,
            remote_id,
            generation,
            engine,
            gauge,
            self.config.peer.max_buffered_bytes,
        );
        self.peers.insert(peer)?;
        Ok(generation)
    }

    fn apply_notice(&mut self, remote_id: &str, generation: Generation, notice: PeerNotice) {
        match notice {
            PeerNotice::Signal(command) => {
                self.signal.send_command(&command);
            }
            PeerNotice::Connected => {
                info!(peer_id = remote_id, "Peer connected");
                self.observers
                    .emit(ControlEvent::PeerConnected(remote_id.to_string()));
            }
            PeerNotice::Writable => {
                self.observers
                    .emit(ControlEvent::PeerWritable(remote_id.to_string()));
            }
            PeerNotice::Message(data) => {
                self.observers.emit(ControlEvent::PeerMessage {
                    remote_id: remote_id.to_string(),
                    data,
                });
            }
            PeerNotice::DisconnectRequested => self.disconnect(remote_id),
            PeerNotice::ChannelsClosed => {
                debug!(peer_id = remote_id, grace_ms = self.config.peer.close_grace_ms, "Scheduling peer reclaim");
                self.queue.post_delayed(
                    self.config.peer.close_grace(),
                    Task::ReclaimPeer {
                        remote_id: remote_id.to_string(),
                        generation,
                    },
                );
            }
            PeerNotice::ConnectionClosed => self.finalize_peer(remote_id, generation),
            PeerNotice::Failed(reason) => {
                self.emit_error(remote_id, reason);
                self.finalize_peer(remote_id, generation);
            }
        }
    }

    fn disconnect_peer(&mut self, remote_id: &str, generation: Generation) {
        let Some(peer) = self.peers.get_live_mut(remote_id, generation) else {
            debug!(peer_id = remote_id, "Peer already gone");
            return;
        };

        peer.close();

        // Nothing open means no close events to wait for.
        let idle = peer.channel_state(ChannelSide::Local) != ChannelState::Open
            && peer.channel_state(ChannelSide::Remote) != ChannelState::Open;
        if idle {
            self.queue.post_delayed(
                self.config.peer.close_grace(),
                Task::ReclaimPeer {
                    remote_id: remote_id.to_string(),
                    generation,
                },
            );
        }
    }

    /// Remove a peer, release its engine and report it gone
    fn finalize_peer(&mut self, remote_id: &str, generation: Generation) {
        let Some(mut peer) = self.peers.remove_live(remote_id, generation) else {
            return;
        };
        peer.close_connection();

        self.observers
            .emit(ControlEvent::PeerDisconnected(remote_id.to_string()));
        self.try_complete_sign_out();
    }

    /// Report sign-out once requested, peerless and disconnected from signaling
    fn try_complete_sign_out(&mut self) {
        let requested = matches!(&self.session, Some(session) if session.sign_out_requested);
        if !requested || !self.peers.is_empty() || self.signal.state() != SignalState::Closed {
            return;
        }

        if let Some(session) = self.session.take() {
            info!(alias = %session.alias, "Signed out");
            self.observers.emit(ControlEvent::SignedOut(session.alias));
        }
    }

    fn teardown(&mut self) {
        for mut peer in self.peers.drain() {
            debug!(peer_id = %peer.remote_id(), "Releasing peer on shutdown");
            peer.close_connection();
        }
        self.signal.shutdown();
        self.running = false;
    }

    fn emit_error(&mut self, id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        error!(id, %reason, "Control error");
        self.observers.emit(ControlEvent::Error {
            id: id.to_string(),
            reason,
        });
    }
}
