//! Socket seam.
//!
//! A [`Connector`] opens a [`TransportLink`]: an outbound text queue plus a
//! stream of [`TransportEvent`]s. The WebSocket implementation runs one pump
//! task per link that owns both halves of the socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use marblebar_core::errors::{ClientError, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::FrameSink;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something that happened on the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Text(String),
    /// The peer closed the link.
    Closed,
    /// The link failed.
    Error(String),
}

/// Outbound half of a link. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<String>,
}

impl LinkSender {
    /// Whether the link's pump has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl FrameSink for LinkSender {
    fn transmit(&self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .map_err(|_| ClientError::transport("link closed"))
    }
}

/// An open link to the peer.
#[derive(Debug)]
pub struct TransportLink {
    sender: LinkSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
}

impl TransportLink {
    /// Assemble a link from its parts.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sender: LinkSender { tx: outbound },
            events,
            shutdown,
        }
    }

    /// Outbound handle.
    pub fn sender(&self) -> &LinkSender {
        &self.sender
    }

    /// Split into the outbound handle, the event stream and the shutdown token.
    pub fn into_parts(
        self,
    ) -> (
        LinkSender,
        mpsc::UnboundedReceiver<TransportEvent>,
        CancellationToken,
    ) {
        (self.sender, self.events, self.shutdown)
    }

    /// Ask the pump to close the socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one link. The future may be dropped to abandon the attempt.
    async fn open(&self, endpoint: &str) -> Result<TransportLink>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<TransportLink> {
        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| ClientError::transport(format!("WebSocket connect: {e}")))?;
        info!(endpoint, "websocket open");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        drop(tokio::spawn(ws_pump(ws, out_rx, event_tx, shutdown.clone())));

        Ok(TransportLink::new(out_tx, event_rx, shutdown))
    }
}

async fn ws_pump(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("closing websocket");
                let _ = ws_tx.send(Message::Close(None)).await;
                let _ = ws_tx.close().await;
                break;
            }
            text = out_rx.recv() => {
                let Some(text) = text else {
                    let _ = ws_tx.close().await;
                    break;
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Text(text.to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        warn!(len = bytes.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
}

/// In-process link pair.
///
/// The returned [`MemoryPeer`] sees everything sent on the link and can
/// inject inbound events.
#[cfg(any(test, feature = "test-util"))]
pub fn memory_link() -> (TransportLink, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let peer = MemoryPeer {
        outbound: out_rx,
        events: event_tx,
        shutdown: shutdown.clone(),
    };
    (TransportLink::new(out_tx, event_rx, shutdown), peer)
}

/// Far end of a [`memory_link`].
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryPeer {
    /// Next frame the client sent, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// A frame the client sent, if one is queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Text(text.into())).is_ok()
    }

    /// Close the link from the peer side.
    pub fn close(&self) -> bool {
        self.events.send(TransportEvent::Closed).is_ok()
    }

    /// Fail the link from the peer side.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Error(reason.into())).is_ok()
    }

    /// Whether the client closed the link.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
