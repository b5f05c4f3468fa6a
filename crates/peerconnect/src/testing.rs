//! Test doubles for the engine, the signal transport and observers
//!
//! Compiled for unit tests and, behind the `test-util` feature, for
//! integration tests and downstream crates.

use crate::control::{ControlEvent, ControlObserver};
use crate::engine::{
    ConnectionEngine, EngineEvent, EngineEventSink, EngineFactory, EngineSpec, SdpKind,
};
use crate::signal::{CloseCode, IceCandidate, SignalState, SignalTransport, SignalingCommand};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A request made to a [`FakeEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpKind, String),
    SetRemoteDescription(SdpKind, String),
    AddCandidate(IceCandidate),
    Send(Bytes),
    CloseChannels,
    Close,
}

/// Engine that records requests and never emits events on its own
#[derive(Debug, Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_sends: AtomicBool,
}

impl FakeEngine {
    /// Every request so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Every request so far, clearing the record
    pub fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Make `send` fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

impl ConnectionEngine for FakeEngine {
    fn create_offer(&self) {
        self.record(EngineCall::CreateOffer);
    }

    fn create_answer(&self) {
        self.record(EngineCall::CreateAnswer);
    }

    fn set_local_description(&self, kind: SdpKind, sdp: String) {
        self.record(EngineCall::SetLocalDescription(kind, sdp));
    }

    fn set_remote_description(&self, kind: SdpKind, sdp: String) {
        self.record(EngineCall::SetRemoteDescription(kind, sdp));
    }

    fn add_candidate(&self, candidate: IceCandidate) {
        self.record(EngineCall::AddCandidate(candidate));
    }

    fn send(&self, data: Bytes) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError("send refused".to_string()));
        }
        self.record(EngineCall::Send(data));
        Ok(())
    }

    fn close_channels(&self) {
        self.record(EngineCall::CloseChannels);
    }

    fn close(&self) {
        self.record(EngineCall::Close);
    }
}

/// A fake engine together with the sink it reports through
#[derive(Debug, Clone)]
pub struct FakePeer {
    pub spec: EngineSpec,
    pub engine: Arc<FakeEngine>,
    pub events: EngineEventSink,
}

impl FakePeer {
    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }
}

/// Factory handing out [`FakeEngine`]s
///
/// Keeps the latest engine per remote id so tests can inspect requests and
/// inject events.
#[derive(Debug, Default)]
pub struct FakeEngineFactory {
    peers: Mutex<HashMap<String, FakePeer>>,
    created: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl FakeEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latest engine created for `remote_id`
    pub fn peer(&self, remote_id: &str) -> Option<FakePeer> {
        self.peers.lock().get(remote_id).cloned()
    }

    /// Remote ids in creation order, repeats included
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Make the next `create` fail
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(&self, spec: EngineSpec, events: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::EngineError(format!(
                "engine for {} failed to initialize",
                spec.remote_id
            )));
        }

        let engine = Arc::new(FakeEngine::default());
        self.created.lock().push(spec.remote_id.clone());
        self.peers.lock().insert(
            spec.remote_id.clone(),
            FakePeer {
                spec,
                engine: Arc::clone(&engine),
                events,
            },
        );
        Ok(engine)
    }
}

#[derive(Debug, Default)]
struct RecordingSignalState {
    state: SignalState,
    sent: Vec<SignalingCommand>,
    connects: u32,
    closes: Vec<CloseCode>,
}

/// Signal transport that records what the control plane asks of it
///
/// State only changes through `connect` (to `Opening`), `close` (to
/// `Closing`) and [`RecordingSignal::set_state`]; tests play the channel's
/// thread by setting the state and feeding the matching events.
#[derive(Debug, Clone, Default)]
pub struct RecordingSignal {
    inner: Arc<Mutex<RecordingSignalState>>,
}

impl RecordingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: SignalState) {
        self.inner.lock().state = state;
    }

    /// Commands accepted so far
    pub fn sent(&self) -> Vec<SignalingCommand> {
        self.inner.lock().sent.clone()
    }

    /// Commands accepted so far, clearing the record
    pub fn take_sent(&self) -> Vec<SignalingCommand> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    /// Names of the commands accepted so far
    pub fn sent_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .sent
            .iter()
            .map(|command| command.command.clone())
            .collect()
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    pub fn closes(&self) -> Vec<CloseCode> {
        self.inner.lock().closes.clone()
    }
}

impl SignalTransport for RecordingSignal {
    fn connect(&self) {
        let mut inner = self.inner.lock();
        inner.connects += 1;
        if matches!(inner.state, SignalState::Closed | SignalState::Closing) {
            inner.state = SignalState::Opening;
        }
    }

    fn close(&self, code: CloseCode) {
        let mut inner = self.inner.lock();
        inner.closes.push(code);
        inner.state = SignalState::Closing;
    }

    fn send_command(&self, command: &SignalingCommand) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SignalState::Opened {
            return false;
        }
        inner.sent.push(command.clone());
        true
    }

    fn state(&self) -> SignalState {
        self.inner.lock().state
    }
}

/// Observer collecting every event
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ControlEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ControlEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// How many recorded events match `predicate`
    pub fn count(&self, predicate: impl Fn(&ControlEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Poll until an event matches `predicate` or `timeout` elapses
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&ControlEvent) -> bool,
    ) -> Option<ControlEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .events
                .lock()
                .iter()
                .find(|event| predicate(event))
                .cloned();
            if found.is_some() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, event: ControlEvent) {
        self.events.lock().push(event);
    }
}

impl ControlObserver for RecordingObserver {
    fn on_signed_in(&self, channel: &str) {
        self.record(ControlEvent::SignedIn(channel.to_string()));
    }

    fn on_signed_out(&self, alias: &str) {
        self.record(ControlEvent::SignedOut(alias.to_string()));
    }

    fn on_peer_connected(&self, remote_id: &str) {
        self.record(ControlEvent::PeerConnected(remote_id.to_string()));
    }

    fn on_peer_disconnected(&self, remote_id: &str) {
        self.record(ControlEvent::PeerDisconnected(remote_id.to_string()));
    }

    fn on_peer_message(&self, remote_id: &str, data: Bytes) {
        self.record(ControlEvent::PeerMessage {
            remote_id: remote_id.to_string(),
            data,
        });
    }

    fn on_peer_writable(&self, remote_id: &str) {
        self.record(ControlEvent::PeerWritable(remote_id.to_string()));
    }

    fn on_error(&self, id: &str, reason: &str) {
        self.record(ControlEvent::Error {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}
