//! Link abstraction and the WebSocket implementation
//!
//! The transport task only talks to a [`Link`] opened by a [`Connector`],
//! so tests can swap the socket for an in-memory backend.

use crate::error::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Data frame read from a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// One open connection to the backend
#[async_trait]
pub trait Link: Send + Sync {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Next data frame; `None` once the peer closed the link
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;

    /// Send a close frame
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Opens links to the backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, uri: &Url) -> Result<Box<dyn Link>, ConnectionError>;
}

/// Connector backed by `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, uri: &Url) -> Result<Box<dyn Link>, ConnectionError> {
        let connecting = tokio_tungstenite::connect_async(uri.as_str());
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        debug!(uri = %uri, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsLink { stream }))
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text))),
                WsMessage::Binary(data) => return Some(Ok(Frame::Binary(data))),
                WsMessage::Close(frame) => {
                    debug!(frame = ?frame, "Peer closed the link");
                    return None;
                }
                // Pongs are queued by tungstenite and flushed on the next write
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Parse and check a channel URI
pub fn parse_channel_uri(uri: &str) -> Result<Url, ConnectionError> {
    let url = Url::parse(uri).map_err(|e| ConnectionError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConnectionError::InvalidUri {
            uri: uri.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}
