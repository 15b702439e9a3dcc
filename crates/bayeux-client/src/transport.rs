//! The opaque WebSocket transport seam.
//!
//! [`Connector`] dials a server and yields a split sink/stream pair carrying
//! UTF-8 text frames. The traits are object-safe so tests can plug in fake
//! transports; [`WsConnector`] is the production implementation on
//! `tokio-tungstenite`.
//!
//! [`FrameStream::next`] must be cancel-safe: the socket's reader polls it
//! inside `tokio::select!`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use bayeux_protocol::constants::MAX_MESSAGE_SIZE;

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    /// The peer vanished without a closing handshake. The socket maps this
    /// to a local `1002` closure instead of surfacing it.
    #[error("connection aborted")]
    ConnectionAborted,

    #[error("transport closed")]
    Closed,
}

/// Outbound half of a connected transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one text frame. Fails on a broken pipe.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Initiates a close handshake. Best-effort; errors are swallowed.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Inbound half of a connected transport.
#[async_trait]
pub trait FrameStream: Send {
    /// The next text frame, or `None` once the connection is gone.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// Dials a server. One call per connect attempt; a failed attempt leaves no
/// state behind.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

/// Production connector on `tokio-tungstenite`.
pub struct WsConnector;

type WsInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);
        let (stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(config), false).await?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsStream { inner: stream })))
    }
}

struct WsSink {
    inner: SplitSink<WsInner, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let _ = self
            .inner
            .send(tungstenite::Message::Close(Some(frame)))
            .await;
    }
}

struct WsStream {
    inner: SplitStream<WsInner>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(tungstenite::Message::Close(_))) => return None,
                // Ping/pong are handled by tungstenite; binary frames have no
                // meaning in Bayeux.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(map_read_error(e))),
                None => return None,
            }
        }
    }
}

fn map_read_error(e: tungstenite::Error) -> TransportError {
    match &e {
        tungstenite::Error::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            TransportError::ConnectionAborted
        }
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => TransportError::ConnectionAborted,
        _ => TransportError::Ws(e),
    }
}
