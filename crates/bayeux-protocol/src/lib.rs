//! Bayeux wire types.
//!
//! Message shapes, server advice, the colon-delimited error string, and
//! JSON-array framing. Pure data — no I/O lives here.

pub mod advice;
pub mod constants;
pub mod error;
pub mod frame;
pub mod messages;

pub use advice::{Advice, Reconnect};
pub use error::ResponseError;
pub use messages::{
    ConnectRequest, DataMessage, DisconnectRequest, HandshakeRequest, ResponseMessage,
    SubscribeRequest, UnsubscribeRequest,
};
