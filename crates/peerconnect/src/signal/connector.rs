//! Signaling transport capability
//!
//! The signal channel does not know which transport carries its frames.
//! A [`SignalConnector`] opens one connection and hands back a
//! [`SignalLink`]: a pair of frame channels whose pump tasks own the
//! actual socket.

use super::protocol::CloseCode;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One unit on the signaling connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Serialized signaling command
    Text(String),
    /// Close request (outgoing) or close notification (incoming)
    Close(CloseCode),
}

/// An open signaling connection
///
/// Dropping `outgoing` lets the pump close the transport. The connection is
/// gone once `incoming` yields `None`; without a preceding
/// `Frame::Close` that counts as an abnormal close.
pub struct SignalLink {
    /// Frames to the server
    pub outgoing: mpsc::UnboundedSender<Frame>,
    /// Frames from the server
    pub incoming: mpsc::UnboundedReceiver<Frame>,
    /// Task writing `outgoing` to the transport; it finishes after writing a
    /// close frame. `None` when frames reach the peer as soon as they are sent.
    pub writer: Option<JoinHandle<()>>,
}

/// Opens signaling connections
#[async_trait]
pub trait SignalConnector: Send + Sync + 'static {
    /// Connect to `url`
    async fn connect(&self, url: &str) -> Result<SignalLink>;
}

/// WebSocket signaling transport
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    /// Sender task: writes frames from the channel to the WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let (message, last) = match frame {
                Frame::Text(text) => (Message::Text(text), false),
                Frame::Close(code) => (
                    Message::Close(Some(CloseFrame {
                        code: WsCloseCode::from(code.to_ws_code()),
                        reason: "End by user".into(),
                    })),
                    true,
                ),
            };

            if let Err(e) = write.send(message).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if last {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: forwards text frames and the close status
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<Frame>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if tx.send(Frame::Text(text)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(close_frame)) => {
                    let code = close_frame
                        .map(|frame| CloseCode::from_ws_code(u16::from(frame.code)))
                        .unwrap_or(CloseCode::Abnormal);
                    info!(%code, "WebSocket connection closed");
                    let _ = tx.send(Frame::Close(code));
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!("Ignoring {} byte binary signaling frame", data.len());
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalLink> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(Self::sender_task(write, outgoing_rx));
        tokio::spawn(Self::receiver_task(read, incoming_tx));

        Ok(SignalLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            writer: Some(writer),
        })
    }
}
