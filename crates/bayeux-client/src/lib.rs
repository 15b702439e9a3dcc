//! Bayeux publish/subscribe client over a self-healing WebSocket.
//!
//! [`BayeuxClient`] opens a long-lived session to a Bayeux server,
//! subscribes channels to typed handlers, publishes messages, and stays
//! subscribed across network outages and server-directed reconnects. The
//! two cores underneath are [`StatefulSocket`] — a reconnecting WebSocket
//! that queues outbound messages while disconnected — and the session layer
//! that adds the handshake, the `/meta/connect` heartbeat, id-correlated
//! request/response, and advice-driven reconnect.
//!
//! ```no_run
//! use bayeux_client::{BayeuxClient, ClientConfig, ReachabilityHandle};
//!
//! # async fn run() -> Result<(), bayeux_client::ClientError> {
//! let config = ClientConfig::new("ws://localhost:8080/bayeux");
//! let client = BayeuxClient::new(config, ReachabilityHandle::always_up());
//! client.connect().await?;
//! client
//!     .subscribe::<serde_json::Value, _>("/ticker", |tick| println!("{tick}"))
//!     .await?;
//! client.publish("/chat", serde_json::json!({"text": "hello"}))?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
pub mod error;
pub mod reachability;
pub mod retry;
pub mod session;
pub mod socket;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

pub use error::ClientError;
pub use reachability::{Reachability, ReachabilityHandle};
pub use session::{BayeuxClient, ClientConfig};
pub use socket::{CloseArgs, StatefulSocket};
pub use transport::{Connector, FrameSink, FrameStream, TransportError, WsConnector};
