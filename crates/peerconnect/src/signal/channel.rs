//! Reconnecting signal channel
//!
//! The channel runs its transport on a dedicated thread with its own tokio
//! runtime. Callers on other threads only flip the shared status and queue
//! an operation, so every public method returns immediately.
//!
//! ```text
//! Closed -> Opening -> Opened -> Closing -> Closed
//!   ^                                         |
//!   +------ reconnect pending (abnormal) <----+
//! ```
//!
//! A close with any code other than `Normal` schedules a reconnect after
//! the policy's backoff; a normal close never does.

use super::backoff::ReconnectPolicy;
use super::connector::{Frame, SignalConnector, SignalLink};
use super::protocol::{CloseCode, SignalingCommand};
use crate::config::SignalConfig;
use crate::queue::QueueSender;
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Connection state of the signal channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Snapshot of the signal channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalStatus {
    /// Connection state
    pub state: SignalState,
    /// Waiting out a backoff delay before the next attempt
    pub reconnect_pending: bool,
    /// Failed attempts since the last successful open
    pub attempts: u32,
}

/// Event raised on the signal channel's own thread
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Opened,
    Closed(CloseCode),
    Command(SignalingCommand),
}

/// Receives signal channel events
///
/// Called on the signal channel's thread. Implementations hand the event
/// over to their own context instead of touching shared state.
pub trait SignalObserver: Send + Sync + 'static {
    fn on_open(&self);
    fn on_close(&self, code: CloseCode);
    fn on_command(&self, command: SignalingCommand);
}

impl<T> SignalObserver for QueueSender<T>
where
    T: From<SignalEvent> + Send + 'static,
{
    fn on_open(&self) {
        self.post(SignalEvent::Opened.into());
    }

    fn on_close(&self, code: CloseCode) {
        self.post(SignalEvent::Closed(code).into());
    }

    fn on_command(&self, command: SignalingCommand) {
        self.post(SignalEvent::Command(command).into());
    }
}

impl SignalObserver for mpsc::UnboundedSender<SignalEvent> {
    fn on_open(&self) {
        let _ = self.send(SignalEvent::Opened);
    }

    fn on_close(&self, code: CloseCode) {
        let _ = self.send(SignalEvent::Closed(code));
    }

    fn on_command(&self, command: SignalingCommand) {
        let _ = self.send(SignalEvent::Command(command));
    }
}

/// Signaling transport as seen by the control plane
pub trait SignalTransport: Send {
    /// Start connecting; no-op while opening or open
    fn connect(&self);

    /// Close with `code`; idempotent
    fn close(&self, code: CloseCode);

    /// Transmit a command if open
    ///
    /// Returns false (and logs) when the command was not handed to the
    /// transport. A true return is no delivery guarantee.
    fn send_command(&self, command: &SignalingCommand) -> bool;

    /// Current connection state
    fn state(&self) -> SignalState;

    /// Stop the transport for good
    fn shutdown(&mut self) {}
}

enum Op {
    Connect,
    Close(CloseCode),
    Send(String),
    Shutdown,
}

/// Persistent signaling client with backoff reconnect
pub struct SignalChannel {
    status: Arc<Mutex<SignalStatus>>,
    ops: mpsc::UnboundedSender<Op>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalChannel {
    /// Start the channel's I/O thread; the channel stays closed until `connect`
    pub fn start(
        config: SignalConfig,
        connector: Arc<dyn SignalConnector>,
        observer: Arc<dyn SignalObserver>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let status = Arc::new(Mutex::new(SignalStatus::default()));
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        let worker = SignalWorker {
            url: config.url.clone(),
            policy: config.reconnect,
            connector,
            observer,
            status: Arc::clone(&status),
            ops: ops_rx,
            attempts: 0,
        };

        let thread = thread::Builder::new()
            .name("peerconnect-signal".to_string())
            .spawn(move || {
                runtime.block_on(worker.run());
                debug!("Signal channel thread exiting");
            })?;

        info!("Signal channel started for {}", config.url);

        Ok(Self {
            status,
            ops: ops_tx,
            thread: Some(thread),
        })
    }

    /// Current status snapshot
    pub fn status(&self) -> SignalStatus {
        *self.status.lock()
    }

    fn request(&self, op: Op) -> bool {
        if self.ops.send(op).is_err() {
            warn!("Signal channel thread is gone");
            return false;
        }
        true
    }
}

impl SignalTransport for SignalChannel {
    fn connect(&self) {
        {
            let mut status = self.status.lock();
            if matches!(status.state, SignalState::Opening | SignalState::Opened) {
                debug!(state = ?status.state, "Signal channel already connecting");
                return;
            }
            status.state = SignalState::Opening;
        }
        self.request(Op::Connect);
    }

    fn close(&self, code: CloseCode) {
        self.status.lock().state = SignalState::Closing;
        self.request(Op::Close(code));
    }

    fn send_command(&self, command: &SignalingCommand) -> bool {
        let state = self.status.lock().state;
        if state != SignalState::Opened {
            warn!(command = %command.command, ?state, "Signal channel not open, dropping command");
            return false;
        }

        match command.to_json() {
            Ok(text) => self.request(Op::Send(text)),
            Err(e) => {
                warn!(command = %command.command, "{}", e);
                false
            }
        }
    }

    fn state(&self) -> SignalState {
        self.status.lock().state
    }

    fn shutdown(&mut self) {
        let _ = self.ops.send(Op::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        let _ = self.ops.send(Op::Shutdown);
    }
}

enum Flow {
    Idle,
    Shutdown,
}

enum SessionEnd {
    Closed(CloseCode),
    Shutdown,
}

/// How long shutdown waits for the transport to write its close frame
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait for the link's writer to finish, since the signal thread's runtime
/// goes away with the worker
async fn flush_close(link: &mut SignalLink) {
    let Some(writer) = link.writer.take() else {
        return;
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await {
        Ok(Ok(())) => debug!("Close frame written"),
        Ok(Err(e)) => warn!("Signal writer task failed: {}", e),
        Err(_) => warn!("Close frame not written within {:?}", CLOSE_FLUSH_TIMEOUT),
    }
}

/// Owns the transport on the signal thread
struct SignalWorker {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn SignalConnector>,
    observer: Arc<dyn SignalObserver>,
    status: Arc<Mutex<SignalStatus>>,
    ops: mpsc::UnboundedReceiver<Op>,
    attempts: u32,
}

impl SignalWorker {
    async fn run(mut self) {
        while let Some(op) = self.ops.recv().await {
            match op {
                Op::Connect => {
                    if let Flow::Shutdown = self.connect_cycle().await {
                        break;
                    }
                }
                Op::Close(code) => self.finish_close(code),
                Op::Send(_) => warn!("Signal channel not connected, dropping command"),
                Op::Shutdown => break,
            }
        }

        self.set_closed();
        debug!("Signal worker stopped");
    }

    /// Connect, run the session, and keep reconnecting after abnormal closes
    async fn connect_cycle(&mut self) -> Flow {
        self.attempts = 0;

        loop {
            let attempts = self.attempts;
            self.update(|status| {
                status.state = SignalState::Opening;
                status.reconnect_pending = false;
                status.attempts = attempts;
            });

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            let connecting = async move { connector.connect(&url).await };
            tokio::pin!(connecting);

            let result = loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    op = self.ops.recv() => match op {
                        Some(Op::Close(code)) => {
                            self.finish_close(code);
                            return Flow::Idle;
                        }
                        Some(Op::Shutdown) | None => return Flow::Shutdown,
                        Some(Op::Send(_)) => warn!("Signal channel still opening, dropping command"),
                        Some(Op::Connect) => {}
                    }
                }
            };

            match result {
                Ok(link) => {
                    self.attempts = 0;
                    self.update(|status| {
                        status.state = SignalState::Opened;
                        status.reconnect_pending = false;
                        status.attempts = 0;
                    });
                    info!(url = %self.url, "Signal channel open");
                    self.observer.on_open();

                    match self.run_session(link).await {
                        SessionEnd::Shutdown => return Flow::Shutdown,
                        SessionEnd::Closed(code) => {
                            self.set_closed();
                            self.observer.on_close(code);
                            if code.is_normal() {
                                info!("Signal channel closed");
                                return Flow::Idle;
                            }
                            warn!(%code, "Signal channel closed abnormally");
                        }
                    }
                }
                Err(e) => {
                    self.set_closed();
                    warn!(attempt = self.attempts, "Signal connection attempt failed: {}", e);
                }
            }

            if !self.policy.should_retry(self.attempts) {
                warn!(attempts = self.attempts, "Giving up reconnecting to signaling server");
                return Flow::Idle;
            }

            let delay = self.policy.delay_for(self.attempts);
            self.attempts = self.attempts.saturating_add(1);
            let attempts = self.attempts;
            self.update(|status| {
                status.reconnect_pending = true;
                status.attempts = attempts;
            });
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempts,
                "Reconnecting to signaling server"
            );

            let wait = tokio::time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    op = self.ops.recv() => match op {
                        Some(Op::Connect) => {
                            self.attempts = 0;
                            break;
                        }
                        Some(Op::Close(code)) => {
                            self.finish_close(code);
                            return Flow::Idle;
                        }
                        Some(Op::Send(_)) => warn!("Signal channel reconnecting, dropping command"),
                        Some(Op::Shutdown) | None => return Flow::Shutdown,
                    }
                }
            }
        }
    }

    async fn run_session(&mut self, mut link: SignalLink) -> SessionEnd {
        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(Op::Send(text)) => {
                        if link.outgoing.send(Frame::Text(text)).is_err() {
                            return SessionEnd::Closed(CloseCode::Abnormal);
                        }
                    }
                    Some(Op::Close(code)) => {
                        self.update(|status| status.state = SignalState::Closing);
                        let _ = link.outgoing.send(Frame::Close(code));
                        return SessionEnd::Closed(code);
                    }
                    Some(Op::Connect) => debug!("Signal channel already open"),
                    Some(Op::Shutdown) | None => {
                        if link.outgoing.send(Frame::Close(CloseCode::GoingAway)).is_ok() {
                            flush_close(&mut link).await;
                        }
                        return SessionEnd::Shutdown;
                    }
                },
                frame = link.incoming.recv() => match frame {
                    Some(Frame::Text(text)) => match SignalingCommand::from_json(&text) {
                        Ok(command) => {
                            trace!(command = %command.command, "Signaling command received");
                            self.observer.on_command(command);
                        }
                        Err(e) => warn!("Dropping malformed signaling message: {}", e),
                    },
                    Some(Frame::Close(code)) => return SessionEnd::Closed(code),
                    None => return SessionEnd::Closed(CloseCode::Abnormal),
                }
            }
        }
    }

    /// Close requested while not connected: cancel any pending retry and report it
    fn finish_close(&mut self, code: CloseCode) {
        self.attempts = 0;
        self.set_closed();
        self.observer.on_close(code);
    }

    fn set_closed(&self) {
        self.update(|status| {
            status.state = SignalState::Closed;
            status.reconnect_pending = false;
        });
    }

    fn update(&self, f: impl FnOnce(&mut SignalStatus)) {
        f(&mut self.status.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::memory::{memory_transport, MemoryListener, MemoryServerLink};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> SignalConfig {
        SignalConfig {
            url: "ws://signal.test".to_string(),
            reconnect: ReconnectPolicy {
                base_delay_ms: 20,
                max_delay_ms: 80,
                ..Default::default()
            },
        }
    }

    fn start(
        config: SignalConfig,
    ) -> (
        SignalChannel,
        MemoryListener,
        crate::signal::memory::MemoryConnector,
        mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        let (connector, listener) = memory_transport();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel =
            SignalChannel::start(config, Arc::new(connector.clone()), Arc::new(events_tx)).unwrap();
        (channel, listener, connector, events_rx)
    }

    async fn accept(listener: &mut MemoryListener) -> MemoryServerLink {
        timeout(WAIT, listener.accept()).await.unwrap().unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_open_exchange_and_normal_close() {
        let (mut channel, mut listener, _connector, mut events) = start(fast_config());
        assert_eq!(channel.state(), SignalState::Closed);
        assert!(!channel.send_command(&SignalingCommand::sign_in("a", "b")));

        channel.connect();
        let mut server = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);
        assert_eq!(channel.state(), SignalState::Opened);

        assert!(channel.send_command(&SignalingCommand::sign_in("alice", "pw")));
        let received = timeout(WAIT, server.recv_command()).await.unwrap().unwrap();
        assert_eq!(received.command, "signin");

        let reply = SignalingCommand::new("signin", json!({ "result": true, "session_id": "s1" }));
        server.send_command(&reply).unwrap();
        assert_eq!(next_event(&mut events).await, SignalEvent::Command(reply));

        channel.close(CloseCode::Normal);
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::Normal)
        );
        assert_eq!(
            timeout(WAIT, server.recv()).await.unwrap(),
            Some(Frame::Close(CloseCode::Normal))
        );
        assert_eq!(channel.state(), SignalState::Closed);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(listener.attempts(), 1);
        assert!(!channel.status().reconnect_pending);

        channel.shutdown();
    }

    /// Transport whose writer takes a while to put each frame on the wire
    struct SlowWriterConnector {
        written: Arc<Mutex<Vec<Frame>>>,
        server: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    }

    #[async_trait]
    impl SignalConnector for SlowWriterConnector {
        async fn connect(&self, _url: &str) -> Result<SignalLink> {
            let (outgoing, mut to_server) = mpsc::unbounded_channel();
            let (to_client, incoming) = mpsc::unbounded_channel();
            *self.server.lock() = Some(to_client);

            let written = Arc::clone(&self.written);
            let writer = tokio::spawn(async move {
                while let Some(frame) = to_server.recv().await {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let last = matches!(frame, Frame::Close(_));
                    written.lock().push(frame);
                    if last {
                        break;
                    }
                }
            });

            Ok(SignalLink {
                outgoing,
                incoming,
                writer: Some(writer),
            })
        }
    }

    #[tokio::test]
    async fn test_shutdown_writes_going_away_before_exit() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let connector = SlowWriterConnector {
            written: Arc::clone(&written),
            server: Mutex::new(None),
        };
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut channel =
            SignalChannel::start(fast_config(), Arc::new(connector), Arc::new(events_tx)).unwrap();

        channel.connect();
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);

        channel.shutdown();
        assert_eq!(
            *written.lock(),
            vec![Frame::Close(CloseCode::GoingAway)]
        );
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_open() {
        let (mut channel, mut listener, _connector, mut events) = start(fast_config());
        channel.connect();
        let _server = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);

        channel.connect();
        channel.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.attempts(), 1);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_abnormal_drop_reconnects() {
        let (mut channel, mut listener, _connector, mut events) = start(fast_config());
        channel.connect();
        let server = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);

        server.drop_connection();
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::Abnormal)
        );

        let _second = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);
        assert_eq!(channel.status().attempts, 0);
        assert_eq!(listener.attempts(), 2);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_server_close_codes() {
        let (mut channel, mut listener, _connector, mut events) = start(fast_config());
        channel.connect();
        let server = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);

        server.close(CloseCode::SignalError);
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::SignalError)
        );
        let server = accept(&mut listener).await;
        assert_eq!(next_event(&mut events).await, SignalEvent::Opened);

        server.close(CloseCode::Normal);
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::Normal)
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(listener.attempts(), 2);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_failed_attempts_back_off_until_close() {
        let (mut channel, listener, connector, mut events) = start(fast_config());
        connector.set_refusing(true);
        channel.connect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = channel.status();
        assert!(listener.attempts() >= 2);
        assert!(status.attempts >= 1);

        channel.close(CloseCode::Normal);
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::Normal)
        );
        let after_close = listener.attempts();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(listener.attempts(), after_close);
        assert_eq!(channel.state(), SignalState::Closed);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_attempt_cap_stops_reconnecting() {
        let mut config = fast_config();
        config.reconnect.max_attempts = 2;
        let (mut channel, listener, connector, _events) = start(config);
        connector.set_refusing(true);
        channel.connect();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(listener.attempts(), 3);
        assert_eq!(channel.state(), SignalState::Closed);
        assert!(!channel.status().reconnect_pending);

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_close_while_idle_reports_closed() {
        let (mut channel, _listener, _connector, mut events) = start(fast_config());
        channel.close(CloseCode::Normal);
        assert_eq!(
            next_event(&mut events).await,
            SignalEvent::Closed(CloseCode::Normal)
        );
        assert_eq!(channel.state(), SignalState::Closed);

        channel.shutdown();
    }
}
