use bayeux_protocol::ResponseError;

use crate::transport::TransportError;

/// Errors surfaced by the Bayeux client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server rejected request: {0}")]
    Response(#[from] ResponseError),
}
