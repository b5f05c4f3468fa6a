//! Connection engine backed by webrtc-rs
//!
//! Each peer gets a worker task on a tokio runtime. Requests from the
//! control plane are queued to the worker and applied in order; the
//! library's callbacks are translated into [`EngineEvent`]s.

use super::{
    ChannelSide, ConnectionEngine, EngineConnectionState, EngineEvent, EngineEventSink,
    EngineFactory, EngineSpec, SdpKind,
};
use crate::config::EngineConfig;
use crate::signal::IceCandidate;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::APIBuilder;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;

/// Creates webrtc-rs peer connections
pub struct WebRtcEngineFactory {
    config: EngineConfig,
    runtime: Handle,
}

impl WebRtcEngineFactory {
    /// Use the runtime the caller is running on
    ///
    /// Fails outside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::EngineError(format!("No tokio runtime for engine workers: {}", e)))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Run engine workers on `runtime`
    pub fn with_runtime(config: EngineConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

impl std::fmt::Debug for WebRtcEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngineFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineFactory for WebRtcEngineFactory {
    fn create(&self, spec: EngineSpec, events: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>> {
        let (ops, rx) = mpsc::unbounded_channel();
        let span = info_span!("engine", peer_id = %spec.remote_id);
        let worker = EngineWorker {
            ice_servers: self.ice_servers(),
            label: spec.channel_label,
            events,
        };
        self.runtime.spawn(worker.run(rx).instrument(span));

        Ok(Arc::new(WebRtcEngine {
            remote_id: spec.remote_id,
            ops,
        }))
    }
}

#[derive(Debug)]
enum EngineOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    AddCandidate(IceCandidate),
    Send(Bytes),
    CloseChannels,
    Close,
}

/// Request side of one peer connection
struct WebRtcEngine {
    remote_id: String,
    ops: mpsc::UnboundedSender<EngineOp>,
}

impl WebRtcEngine {
    fn request(&self, op: EngineOp) -> bool {
        if self.ops.send(op).is_err() {
            debug!(peer_id = %self.remote_id, "Engine worker gone, dropping request");
            return false;
        }
        true
    }
}

impl ConnectionEngine for WebRtcEngine {
    fn create_offer(&self) {
        self.request(EngineOp::CreateOffer);
    }

    fn create_answer(&self) {
        self.request(EngineOp::CreateAnswer);
    }

    fn set_local_description(&self, kind: SdpKind, sdp: String) {
        self.request(EngineOp::SetLocal(kind, sdp));
    }

    fn set_remote_description(&self, kind: SdpKind, sdp: String) {
        self.request(EngineOp::SetRemote(kind, sdp));
    }

    fn add_candidate(&self, candidate: IceCandidate) {
        self.request(EngineOp::AddCandidate(candidate));
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.request(EngineOp::Send(data)) {
            Ok(())
        } else {
            Err(Error::DataChannelError(format!(
                "engine for {} stopped",
                self.remote_id
            )))
        }
    }

    fn close_channels(&self) {
        self.request(EngineOp::CloseChannels);
    }

    fn close(&self) {
        self.request(EngineOp::Close);
    }
}

/// Reports open/close for one data channel, close at most once
struct ChannelReporter {
    side: ChannelSide,
    events: EngineEventSink,
    closed: AtomicBool,
}

impl ChannelReporter {
    fn new(side: ChannelSide, events: EngineEventSink) -> Arc<Self> {
        Arc::new(Self {
            side,
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn opened(&self) {
        self.events.emit(EngineEvent::ChannelOpen(self.side));
    }

    fn closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(EngineEvent::ChannelClosed(self.side));
        }
    }
}

struct EngineWorker {
    ice_servers: Vec<RTCIceServer>,
    label: String,
    events: EngineEventSink,
}

impl EngineWorker {
    async fn run(self, mut ops: mpsc::UnboundedReceiver<EngineOp>) {
        let pc = match self.build_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                warn!("Failed to create peer connection: {}", e);
                self.events.emit(EngineEvent::Failed(e.to_string()));
                return;
            }
        };

        let remote: Arc<Mutex<Option<(Arc<RTCDataChannel>, Arc<ChannelReporter>)>>> =
            Arc::new(Mutex::new(None));
        self.install_handlers(&pc, Arc::clone(&remote));

        let local = match pc.create_data_channel(&self.label, None).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to create data channel: {}", e);
                self.events
                    .emit(EngineEvent::Failed(format!("Failed to create data channel: {}", e)));
                let _ = pc.close().await;
                return;
            }
        };
        let local_reporter = ChannelReporter::new(ChannelSide::Local, self.events.clone());
        self.events.emit(EngineEvent::ChannelAttached(ChannelSide::Local));
        wire_channel(&local, &local_reporter, &self.events).await;
        debug!(label = %self.label, "Local data channel created");

        while let Some(op) = ops.recv().await {
            // Only negotiation failures end the connection; a rejected
            // candidate or write leaves the peer as it is.
            let fatal = match op {
                EngineOp::CreateOffer => self.describe(&pc, SdpKind::Offer).await,
                EngineOp::CreateAnswer => self.describe(&pc, SdpKind::Answer).await,
                EngineOp::SetLocal(kind, sdp) => set_description(&pc, kind, sdp, true).await,
                EngineOp::SetRemote(kind, sdp) => set_description(&pc, kind, sdp, false).await,
                EngineOp::AddCandidate(candidate) => {
                    if let Err(e) = add_candidate(&pc, candidate).await {
                        warn!("Dropping remote candidate: {}", e);
                    }
                    Ok(())
                }
                EngineOp::Send(data) => {
                    self.send(&local, data).await;
                    Ok(())
                }
                EngineOp::CloseChannels => {
                    close_channel(&local, &local_reporter).await;
                    let remote = remote.lock().clone();
                    if let Some((channel, reporter)) = remote {
                        close_channel(&channel, &reporter).await;
                    }
                    Ok(())
                }
                EngineOp::Close => break,
            };

            if let Err(e) = fatal {
                warn!("Negotiation failed: {}", e);
                self.events.emit(EngineEvent::Failed(e.to_string()));
            }
        }

        if let Err(e) = pc.close().await {
            debug!("Error closing peer connection: {}", e);
        }
        info!("Peer connection released");
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::EngineError(format!("Failed to create peer connection: {}", e))
        })?;
        Ok(Arc::new(pc))
    }

    fn install_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        remote: Arc<Mutex<Option<(Arc<RTCDataChannel>, Arc<ChannelReporter>)>>>,
    ) {
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(EngineEvent::CandidateReady(IceCandidate {
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        candidate: init.candidate,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(state) = map_connection_state(state) {
                    debug!(?state, "Connection state changed");
                    events.emit(EngineEvent::ConnectionStateChanged(state));
                }
            })
        }));

        let events = self.events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            let remote = Arc::clone(&remote);
            Box::pin(async move {
                info!(label = %channel.label(), "Remote data channel attached");
                let reporter = ChannelReporter::new(ChannelSide::Remote, events.clone());
                *remote.lock() = Some((Arc::clone(&channel), Arc::clone(&reporter)));
                events.emit(EngineEvent::ChannelAttached(ChannelSide::Remote));
                wire_channel(&channel, &reporter, &events).await;
            })
        }));
    }

    async fn describe(&self, pc: &RTCPeerConnection, kind: SdpKind) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => pc.create_offer(None).await,
            SdpKind::Answer => pc.create_answer(None).await,
        }
        .map_err(|e| Error::SdpError(format!("Failed to create {}: {}", kind, e)))?;

        self.events.emit(EngineEvent::LocalDescriptionReady {
            kind,
            sdp: description.sdp,
        });
        Ok(())
    }

    /// Write one queued message; always reports completion so the gauge
    /// stops counting it as pending
    async fn send(&self, channel: &RTCDataChannel, data: Bytes) {
        if let Err(e) = channel.send(&data).await {
            warn!(bytes = data.len(), "Failed to send: {}", e);
        }

        let buffered = channel.buffered_amount().await;
        self.events.emit(EngineEvent::SendCompleted {
            bytes: data.len() as u64,
            buffered: buffered as u64,
        });
    }
}

async fn wire_channel(
    channel: &Arc<RTCDataChannel>,
    reporter: &Arc<ChannelReporter>,
    events: &EngineEventSink,
) {
    let on_open = Arc::clone(reporter);
    channel.on_open(Box::new(move || {
        on_open.opened();
        Box::pin(async {})
    }));

    let on_close = Arc::clone(reporter);
    channel.on_close(Box::new(move || {
        on_close.closed();
        Box::pin(async {})
    }));

    let on_message = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        on_message.emit(EngineEvent::Message(msg.data));
        Box::pin(async {})
    }));

    if reporter.side == ChannelSide::Local {
        // Fires when the queue drains to zero
        channel.set_buffered_amount_low_threshold(0).await;
        let drained = events.clone();
        channel
            .on_buffered_amount_low(Box::new(move || {
                drained.emit(EngineEvent::BufferedAmountChanged(0));
                Box::pin(async {})
            }))
            .await;
    }
}

async fn close_channel(channel: &RTCDataChannel, reporter: &ChannelReporter) {
    if let Err(e) = channel.close().await {
        debug!(side = ?reporter.side, "Error closing data channel: {}", e);
    }
    reporter.closed();
}

async fn set_description(pc: &RTCPeerConnection, kind: SdpKind, sdp: String, local: bool) -> Result<()> {
    let description = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| Error::SdpError(format!("Invalid {} description: {}", kind, e)))?;

    let applied = if local {
        pc.set_local_description(description).await
    } else {
        pc.set_remote_description(description).await
    };
    applied.map_err(|e| {
        let side = if local { "local" } else { "remote" };
        Error::SdpError(format!("Failed to set {} {}: {}", side, kind, e))
    })
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) -> Result<()> {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.sdp_mid),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    };
    pc.add_ice_candidate(init)
        .await
        .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
}

fn map_connection_state(state: RTCIceConnectionState) -> Option<EngineConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(EngineConnectionState::New),
        RTCIceConnectionState::Checking => Some(EngineConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(EngineConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(EngineConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(EngineConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(EngineConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(EngineConnectionState::Closed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;
    use crate::peer::BufferGauge;

    fn config() -> EngineConfig {
        EngineConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
        }
    }

    #[test]
    fn test_map_connection_state() {
        assert_eq!(
            map_connection_state(RTCIceConnectionState::Connected),
            Some(EngineConnectionState::Connected)
        );
        assert_eq!(
            map_connection_state(RTCIceConnectionState::Failed),
            Some(EngineConnectionState::Failed)
        );
        assert_eq!(map_connection_state(RTCIceConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_ice_servers_include_turn_credentials() {
        let factory = WebRtcEngineFactory::new(config()).unwrap();
        let servers = factory.ice_servers();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = WebRtcEngineFactory::new(config()).unwrap_err();
        assert!(matches!(err, Error::EngineError(_)));
    }

    fn spawn_engine() -> (Arc<dyn ConnectionEngine>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EngineEventSink::new(Arc::new(BufferGauge::new()), move |event| {
            let _ = tx.send(event);
        });
        let factory = WebRtcEngineFactory::new(EngineConfig::default()).unwrap();
        let engine = factory
            .create(
                EngineSpec {
                    local_id: "alice".to_string(),
                    remote_id: "bob".to_string(),
                    channel_label: "alice-bob".to_string(),
                },
                sink,
            )
            .unwrap();
        (engine, rx)
    }

    #[tokio::test]
    async fn test_rejected_candidate_keeps_engine_running() {
        let (engine, mut rx) = spawn_engine();

        // No remote description yet, so the library refuses the candidate
        engine.add_candidate(IceCandidate {
            candidate: "garbage".to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
        });
        engine.create_offer();

        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("engine event")
                .expect("sink open");
            match event {
                EngineEvent::Failed(reason) => panic!("engine failed: {}", reason),
                EngineEvent::LocalDescriptionReady { kind, .. } => {
                    assert_eq!(kind, SdpKind::Offer);
                    break;
                }
                _ => {}
            }
        }
        engine.close();
    }

    #[tokio::test]
    async fn test_create_offer_emits_description_and_local_channel() {
        let (engine, mut rx) = spawn_engine();

        engine.create_offer();

        let mut attached = false;
        let sdp = loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("engine event")
                .expect("sink open");
            match event {
                EngineEvent::ChannelAttached(ChannelSide::Local) => attached = true,
                EngineEvent::LocalDescriptionReady { kind, sdp } => {
                    assert_eq!(kind, SdpKind::Offer);
                    break sdp;
                }
                _ => {}
            }
        };

        assert!(attached);
        assert!(sdp.contains("webrtc-datachannel"));
        engine.close();
    }
}
