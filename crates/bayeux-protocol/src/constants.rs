use std::time::Duration;

/// Bayeux protocol version sent in handshakes.
pub const VERSION: &str = "1.0";

/// The only connection type this client supports.
pub const CONNECTION_TYPE: &str = "websocket";

/// Default advice interval applied before the server supplies one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Timeout for id-correlated request/response operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum inbound frame size in bytes (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Local force-close used on network-down and connection-abort events.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Meta channel paths.
pub mod channel {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const DISCONNECT: &str = "/meta/disconnect";
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";

    /// Returns `true` for `/meta/*` control channels.
    pub fn is_meta(channel: &str) -> bool {
        channel.starts_with("/meta/")
    }
}
