//! Persistent socket seam shared by the multiplexer and exec sessions.
//!
//! A [`Connector`] turns a URL into a [`SocketLink`]: an outbound sender and
//! an inbound event receiver. The production connector pumps a websocket
//! from two halves of a `tokio-tungstenite` stream; the components never see
//! the websocket itself, so tests can hand them channel-backed links.

use futures::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::debug;

use crate::error::TransportError;

/// Websocket close code for a clean, intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    ClosedNormal,
    ClosedAbnormal,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedNormal | Self::ClosedAbnormal)
    }
}

/// Frames written by the owner of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a normal-closure close frame and stop writing.
    Close,
}

/// Events read from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The peer closed the socket. `code` is `None` when the stream ended
    /// without a close frame.
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

impl SocketEvent {
    pub fn is_normal_close(&self) -> bool {
        matches!(self, Self::Closed { code: Some(NORMAL_CLOSURE), .. })
    }
}

pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketLink {
    /// Queue a text frame. Returns false once the writer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<SocketLink, TransportError>> + Send;
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketLink, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(TransportError::from_tungstenite)?;
        debug!(url, "websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        // Owner asked to close, or dropped the link.
                        Some(Outbound::Close) | None => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client closed".into(),
                            };
                            let _ = ws_write.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    },
                    msg = ws_read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(SocketEvent::Text(text.as_str().to_owned())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let text = String::from_utf8_lossy(&data).into_owned();
                            if in_tx.send(SocketEvent::Text(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = match frame {
                                Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                                None => (None, String::new()),
                            };
                            let _ = in_tx.send(SocketEvent::Closed { code, reason });
                            break;
                        }
                        // Ping/pong are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = in_tx.send(SocketEvent::Closed {
                                code: None,
                                reason: "stream ended".to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            debug!("websocket pump stopped");
        });

        Ok(SocketLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// `http(s)://` → `ws(s)://`; other schemes are returned unchanged.
pub fn ws_base_url(http_base: &str) -> String {
    let base = http_base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}
