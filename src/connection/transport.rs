//! Transports that carry text frames to and from the backend.
//!
//! A [`Transport`] opens a [`Socket`]: a pair of channels the connection
//! driver reads and writes without knowing what sits behind them.
//! [`WebSocketTransport`] is the production implementation; [`MemoryTransport`]
//! keeps both ends in-process for tests and embedding hosts.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::{Envelope, OutboundMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid handshake request: {0}")]
    Request(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection refused: {0}")]
    Refused(String),
}

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    /// Start a normal closing handshake
    Close,
}

/// Event read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The channel closed. `clean` means a normal closing handshake (code 1000).
    Closed { clean: bool, reason: Option<String> },
}

/// An open channel. Dropping it closes the underlying connection.
#[derive(Debug)]
pub struct Socket {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `url`, attaching `token` as a bearer credential.
    async fn open(&self, url: &Url, token: Option<&str>) -> Result<Socket, TransportError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url, token: Option<&str>) -> Result<Socket, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Request(format!("invalid token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        info!(
            "WebSocket connected to {} (status {})",
            url,
            response.status()
        );

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outgoing::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("WebSocket write failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        let _ = write.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => SocketEvent::Text(text),
                    Ok(Message::Close(frame)) => {
                        let clean = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = inbound_tx.send(SocketEvent::Closed { clean, reason });
                        return;
                    }
                    Ok(Message::Binary(bytes)) => {
                        debug!("Ignoring binary frame ({} bytes)", bytes.len());
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(SocketEvent::Closed {
                            clean: false,
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    // Receiver dropped: the driver abandoned this socket.
                    return;
                }
            }
            let _ = inbound_tx.send(SocketEvent::Closed {
                clean: false,
                reason: Some("stream ended".to_string()),
            });
        });

        Ok(Socket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-process transport. Every successful `open` hands a [`MemoryPeer`] to the
/// paired [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refuse_remaining: Arc<AtomicU32>,
    opens: Arc<AtomicU32>,
}

/// Server side of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse_remaining: Arc<AtomicU32>,
    opens: Arc<AtomicU32>,
}

/// Server end of one in-memory socket.
#[derive(Debug)]
pub struct MemoryPeer {
    received: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

/// Create a connected transport/server pair.
pub fn memory_transport() -> (MemoryTransport, MemoryServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse_remaining = Arc::new(AtomicU32::new(0));
    let opens = Arc::new(AtomicU32::new(0));
    (
        MemoryTransport {
            accepted: tx,
            refuse_remaining: refuse_remaining.clone(),
            opens: opens.clone(),
        },
        MemoryServer {
            accepted: rx,
            refuse_remaining,
            opens,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url, _token: Option<&str>) -> Result<Socket, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Refused(url.to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(MemoryPeer {
                received: outbound_rx,
                events: inbound_tx,
            })
            .map_err(|_| TransportError::Refused("memory server dropped".to_string()))?;

        Ok(Socket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

impl MemoryServer {
    /// Wait for the next opened socket.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Refuse the next `count` open attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }

    /// Total open attempts, refused ones included.
    pub fn open_attempts(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// Deliver a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(SocketEvent::Text(text.into())).is_ok()
    }

    /// Deliver an envelope with the given `type` and `data`.
    pub fn send_frame(&self, kind: &str, data: Value) -> bool {
        match serde_json::to_string(&Envelope::new(kind, data)) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Close the channel from the server side.
    pub fn close(self, clean: bool) {
        let _ = self.events.send(SocketEvent::Closed {
            clean,
            reason: None,
        });
    }

    /// Next frame written by the client, decoded. `None` once the client
    /// closed the socket.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.received.recv().await? {
                Outgoing::Text(text) => {
                    if let Ok(envelope) = serde_json::from_str(&text) {
                        return Some(envelope);
                    }
                }
                Outgoing::Close => return None,
            }
        }
    }

    /// Frames already written by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            if let Outgoing::Text(text) = frame {
                if let Ok(envelope) = serde_json::from_str(&text) {
                    frames.push(envelope);
                }
            }
        }
        frames
    }

    /// Wait for the next frame of the given outbound kind, skipping others.
    pub async fn recv_kind(&mut self, message: &OutboundMessage) -> Option<Envelope> {
        let kind = message.kind();
        loop {
            let envelope = self.recv().await?;
            let task_id = envelope.data.get("task_id").and_then(Value::as_str);
            if envelope.kind == kind && task_id == message.task_id() {
                return Some(envelope);
            }
        }
    }
}
