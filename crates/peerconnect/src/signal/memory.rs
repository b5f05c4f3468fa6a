//! In-process signaling transport
//!
//! [`memory_transport`] returns a connector for a signal channel and a
//! listener that plays the signaling server: every successful `connect`
//! surfaces as one [`MemoryServerLink`] on the listener. Used for loopback
//! deployments and tests.

use super::connector::{Frame, SignalConnector, SignalLink};
use super::protocol::{CloseCode, SignalingCommand};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Create a connected connector/listener pair
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let state = Arc::new(ConnectorState::default());

    (
        MemoryConnector {
            accept_tx,
            state: Arc::clone(&state),
        },
        MemoryListener { accept_rx, state },
    )
}

#[derive(Debug, Default)]
struct ConnectorState {
    refusing: AtomicBool,
    attempts: AtomicU32,
}

/// Client side: hands links to the listener
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryServerLink>,
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    /// Refuse (or accept again) subsequent connection attempts
    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<SignalLink> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(url, attempt, "Connecting in-process signal link");

        if self.state.refusing.load(Ordering::SeqCst) {
            return Err(Error::SignalingError(format!("{} refused connection", url)));
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();

        let server_link = MemoryServerLink {
            incoming: to_server_rx,
            outgoing: to_client_tx,
        };
        self.accept_tx
            .send(server_link)
            .map_err(|_| Error::SignalingError(format!("{} is not listening", url)))?;

        Ok(SignalLink {
            outgoing: to_server_tx,
            incoming: to_client_rx,
            writer: None,
        })
    }
}

/// Server side: yields one link per accepted connection
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryServerLink>,
    state: Arc<ConnectorState>,
}

impl MemoryListener {
    /// Wait for the next connection
    pub async fn accept(&mut self) -> Option<MemoryServerLink> {
        self.accept_rx.recv().await
    }

    /// Total connection attempts, including refused ones
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one in-process signaling connection
pub struct MemoryServerLink {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl MemoryServerLink {
    /// Next frame sent by the client; `None` once it hung up
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Next command sent by the client, skipping anything unparsable
    ///
    /// Returns `None` when the client closed or hung up.
    pub async fn recv_command(&mut self) -> Option<SignalingCommand> {
        loop {
            match self.incoming.recv().await? {
                Frame::Text(text) => match SignalingCommand::from_json(&text) {
                    Ok(command) => return Some(command),
                    Err(e) => debug!("Skipping unparsable frame: {}", e),
                },
                Frame::Close(_) => return None,
            }
        }
    }

    /// Send a command to the client
    pub fn send_command(&self, command: &SignalingCommand) -> Result<()> {
        self.send_text(command.to_json()?)
    }

    /// Send raw text to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.outgoing
            .send(Frame::Text(text.into()))
            .map_err(|_| Error::SignalingError("client link is gone".to_string()))
    }

    /// Close the connection with `code`
    pub fn close(self, code: CloseCode) {
        let _ = self.outgoing.send(Frame::Close(code));
    }

    /// Drop the connection without a close frame
    pub fn drop_connection(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_link_carries_frames_both_ways() {
        let (connector, mut listener) = memory_transport();
        let mut link = connector.connect("memory://signal").await.unwrap();
        let mut server = listener.accept().await.unwrap();

        link.outgoing
            .send(Frame::Text(
                SignalingCommand::sign_in("alice", "pw").to_json().unwrap(),
            ))
            .unwrap();
        let command = server.recv_command().await.unwrap();
        assert_eq!(command.command, "signin");

        server
            .send_command(&SignalingCommand::new(
                "signin",
                json!({ "result": true, "session_id": "s1" }),
            ))
            .unwrap();
        assert!(matches!(link.incoming.recv().await, Some(Frame::Text(_))));

        server.close(CloseCode::Normal);
        assert_eq!(
            link.incoming.recv().await,
            Some(Frame::Close(CloseCode::Normal))
        );
        assert_eq!(link.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn test_refusing_connector() {
        let (connector, listener) = memory_transport();
        connector.set_refusing(true);

        assert!(connector.connect("memory://signal").await.is_err());
        assert_eq!(listener.attempts(), 1);

        connector.set_refusing(false);
        assert!(connector.connect("memory://signal").await.is_ok());
        assert_eq!(listener.attempts(), 2);
    }

    #[tokio::test]
    async fn test_dropped_listener_refuses() {
        let (connector, listener) = memory_transport();
        drop(listener);
        assert!(connector.connect("memory://signal").await.is_err());
    }
}
