//! End-to-end control flows against an in-process signaling server

use peerconnect::engine::{EngineEvent, SdpKind};
use peerconnect::signal::protocol::commands;
use peerconnect::signal::{Frame, MemoryListener, MemoryServerLink};
use peerconnect::testing::{EngineCall, FakeEngineFactory, RecordingObserver};
use peerconnect::{
    memory_transport, ChannelSide, CloseCode, Control, ControlEvent, ControlHandle, Error,
    PeerConnectConfig, PeerState, ReconnectPolicy, SignalingCommand,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    control: ControlHandle,
    listener: MemoryListener,
    engines: Arc<FakeEngineFactory>,
    observer: Arc<RecordingObserver>,
}

fn config() -> PeerConnectConfig {
    PeerConnectConfig::default()
        .with_signal_url("ws://signal.test")
        .with_reconnect_policy(ReconnectPolicy {
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..Default::default()
        })
}

fn start() -> Fixture {
    let (connector, listener) = memory_transport();
    let engines = FakeEngineFactory::new();
    let observer = RecordingObserver::new();
    let control = Control::spawn(config(), Arc::new(connector), engines.clone(), &observer)
        .expect("control starts");

    Fixture {
        control,
        listener,
        engines,
        observer,
    }
}

async fn accept(listener: &mut MemoryListener) -> MemoryServerLink {
    tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("connection within timeout")
        .expect("listener open")
}

async fn expect_command(link: &mut MemoryServerLink, name: &str) -> SignalingCommand {
    let command = tokio::time::timeout(WAIT, link.recv_command())
        .await
        .expect("command within timeout")
        .expect("link open");
    assert_eq!(command.command, name);
    command
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Answer the sign-in handshake as the server would
async fn complete_sign_in(link: &mut MemoryServerLink, alias: &str) {
    let signin = expect_command(link, commands::SIGNIN).await;
    assert_eq!(signin.data["user_id"], "alice");
    link.send_command(&SignalingCommand::new(
        commands::SIGNIN,
        json!({ "result": true, "session_id": "s1" }),
    ))
    .unwrap();

    let create = expect_command(link, commands::CREATE_CHANNEL).await;
    assert_eq!(create.data["name"], alias);
    link.send_command(&SignalingCommand::new(
        commands::CHANNEL_CREATED,
        json!({ "name": alias, "result": true }),
    ))
    .unwrap();
}

async fn signed_in(fixture: &mut Fixture) -> MemoryServerLink {
    fixture.control.sign_in("alice", "pw", "alice-room");
    let mut link = accept(&mut fixture.listener).await;
    complete_sign_in(&mut link, "alice-room").await;

    let channel = ControlEvent::SignedIn("alice-room".to_string());
    assert!(fixture
        .observer
        .wait_for(WAIT, |event| *event == channel)
        .await
        .is_some());
    link
}

async fn offer_to_bob(fixture: &Fixture, link: &MemoryServerLink) {
    link.send_command(&SignalingCommand::new(
        commands::CREATE_OFFER,
        json!({ "peers": ["bob"] }),
    ))
    .unwrap();

    let engines = Arc::clone(&fixture.engines);
    eventually(|| engines.peer("bob").is_some()).await;
}

#[tokio::test]
async fn test_sign_in_creates_alias_channel() {
    let mut fixture = start();
    let _link = signed_in(&mut fixture).await;

    let status = fixture.control.status().await.unwrap();
    assert_eq!(status.user_id.as_deref(), Some("alice"));
    assert_eq!(status.alias.as_deref(), Some("alice-room"));
    assert_eq!(status.session_id.as_deref(), Some("s1"));
    assert!(status.peers.is_empty());

    fixture.control.shutdown();
}

#[tokio::test]
async fn test_create_offer_negotiates_and_connects() {
    let mut fixture = start();
    let mut link = signed_in(&mut fixture).await;
    offer_to_bob(&fixture, &link).await;

    let bob = fixture.engines.peer("bob").unwrap();
    assert_eq!(bob.spec.channel_label, "pc_data_bob");
    assert_eq!(bob.spec.local_id, "alice-room");

    let status = fixture.control.status().await.unwrap();
    assert_eq!(status.peers.len(), 1);
    assert_eq!(status.peers[0].remote_id, "bob");
    assert_eq!(status.peers[0].state, PeerState::Connecting);

    bob.emit(EngineEvent::LocalDescriptionReady {
        kind: SdpKind::Offer,
        sdp: "v=0 offer".to_string(),
    });
    let offer = expect_command(&mut link, commands::OFFER_SDP).await;
    assert_eq!(offer.peer_id.as_deref(), Some("bob"));
    assert_eq!(offer.data["sdp"], "v=0 offer");

    link.send_command(
        &SignalingCommand::new(commands::ANSWER_SDP, json!({ "sdp": "v=0 answer" }))
            .with_peer("bob"),
    )
    .unwrap();
    let engine = Arc::clone(&bob.engine);
    eventually(|| {
        engine.calls().contains(&EngineCall::SetRemoteDescription(
            SdpKind::Answer,
            "v=0 answer".to_string(),
        ))
    })
    .await;

    bob.emit(EngineEvent::ChannelOpen(ChannelSide::Local));
    bob.emit(EngineEvent::ChannelAttached(ChannelSide::Remote));
    bob.emit(EngineEvent::ChannelOpen(ChannelSide::Remote));

    let connected = ControlEvent::PeerConnected("bob".to_string());
    assert!(fixture
        .observer
        .wait_for(WAIT, |event| *event == connected)
        .await
        .is_some());

    fixture.control.send("bob", "hello").await.unwrap();
    assert!(bob
        .engine
        .calls()
        .contains(&EngineCall::Send(bytes::Bytes::from_static(b"hello"))));

    fixture.control.shutdown();
}

#[tokio::test]
async fn test_sign_out_completes_after_normal_close() {
    let mut fixture = start();
    let mut link = signed_in(&mut fixture).await;

    fixture.control.sign_out();

    let frame = tokio::time::timeout(WAIT, link.recv()).await.unwrap();
    assert_eq!(frame, Some(Frame::Close(CloseCode::Normal)));

    let signed_out = ControlEvent::SignedOut("alice-room".to_string());
    assert!(fixture
        .observer
        .wait_for(WAIT, |event| *event == signed_out)
        .await
        .is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fixture
            .observer
            .count(|event| matches!(event, ControlEvent::SignedOut(_))),
        1
    );

    fixture.control.shutdown();
}

#[tokio::test]
async fn test_reconnects_and_signs_in_again_after_drop() {
    let mut fixture = start();
    let link = signed_in(&mut fixture).await;

    link.drop_connection();

    let mut link = accept(&mut fixture.listener).await;
    let signin = expect_command(&mut link, commands::SIGNIN).await;
    assert_eq!(signin.data["user_id"], "alice");
    assert_eq!(fixture.listener.attempts(), 2);

    fixture.control.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_send_waits_for_drain() {
    let mut fixture = start();
    let link = signed_in(&mut fixture).await;
    offer_to_bob(&fixture, &link).await;

    let bob = fixture.engines.peer("bob").unwrap();
    bob.emit(EngineEvent::ChannelOpen(ChannelSide::Local));
    bob.emit(EngineEvent::ChannelAttached(ChannelSide::Remote));
    bob.emit(EngineEvent::ChannelOpen(ChannelSide::Remote));

    let connected = ControlEvent::PeerConnected("bob".to_string());
    assert!(fixture
        .observer
        .wait_for(WAIT, |event| *event == connected)
        .await
        .is_some());

    let control = fixture.control.clone();
    let sending = tokio::task::spawn_blocking(move || control.sync_send("bob", "payload"));

    let engine = Arc::clone(&bob.engine);
    eventually(|| {
        engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::Send(_)))
    })
    .await;
    assert!(!sending.is_finished());

    // A drain report alone does not cover a write the engine has not finished
    bob.emit(EngineEvent::BufferedAmountChanged(0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sending.is_finished());

    bob.emit(EngineEvent::SendCompleted {
        bytes: 7,
        buffered: 0,
    });
    let result = tokio::time::timeout(WAIT, sending).await.unwrap().unwrap();
    assert!(result.is_ok());

    fixture.control.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_send_to_unknown_peer() {
    let fixture = start();

    let control = fixture.control.clone();
    let result = tokio::task::spawn_blocking(move || control.sync_send("nobody", "payload"))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::PeerNotFound(id)) if id == "nobody"));

    fixture.control.shutdown();
}

#[tokio::test]
async fn test_requests_after_shutdown_report_stopped() {
    let fixture = start();
    fixture.control.shutdown();

    assert!(matches!(
        fixture.control.status().await,
        Err(Error::ControlStopped)
    ));
    assert!(matches!(
        fixture.control.broadcast("late").await,
        Err(Error::ControlStopped)
    ));
}
