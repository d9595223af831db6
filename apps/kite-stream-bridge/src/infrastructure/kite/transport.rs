//! WebSocket Transport
//!
//! `FeedTransport` adapter over `tokio-tungstenite`. The session maps
//! WebSocket messages onto the transport-neutral frames the ticker consumes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    FeedSession, FeedTransport, InboundFrame, OutboundFrame, TransportError,
};

/// Opens ticker connections over TLS WebSockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl WsTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => Ok(Box::new(WsSession { stream })),
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    Err(TransportError::Unauthorized(status.to_string()))
                } else {
                    Err(TransportError::Connect(format!("upgrade refused: {status}")))
                }
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Open ticker WebSocket.
pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Ping => Message::Ping(bytes::Bytes::new()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
        };

        let frame = match message {
            Message::Binary(data) => InboundFrame::Binary(data),
            Message::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
            Message::Ping(data) => {
                if let Err(e) = self.stream.send(Message::Pong(data)).await {
                    return Some(Err(TransportError::Io(e.to_string())));
                }
                InboundFrame::Keepalive
            }
            Message::Pong(_) | Message::Frame(_) => InboundFrame::Keepalive,
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    tracing::info!(code = %frame.code, reason = %frame.reason, "Server sent close frame");
                }
                InboundFrame::Close
            }
        };

        Some(Ok(frame))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}
