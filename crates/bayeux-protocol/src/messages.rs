//! Bayeux message shapes.
//!
//! All types serialize with camelCase property names; optional fields are
//! omitted when absent. Ids are assigned by the session (strictly increasing
//! from 1) and `clientId` is stamped at serialization time, so constructors
//! leave both unset.

use serde::{Deserialize, Serialize};

use crate::advice::Advice;
use crate::constants::{channel, CONNECTION_TYPE, VERSION};

/// Opens a session: `/meta/handshake`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    pub version: String,
    pub supported_connection_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl HandshakeRequest {
    pub fn new() -> Self {
        Self {
            id: None,
            channel: channel::HANDSHAKE.to_owned(),
            version: VERSION.to_owned(),
            supported_connection_types: vec![CONNECTION_TYPE.to_owned()],
            client_id: None,
            ext: None,
        }
    }
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// The heartbeat request: `/meta/connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl ConnectRequest {
    pub fn new() -> Self {
        Self {
            id: None,
            channel: channel::CONNECT.to_owned(),
            connection_type: CONNECTION_TYPE.to_owned(),
            client_id: None,
            ext: None,
        }
    }
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends a session: `/meta/disconnect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl DisconnectRequest {
    pub fn new() -> Self {
        Self {
            id: None,
            channel: channel::DISCONNECT.to_owned(),
            client_id: None,
            ext: None,
        }
    }
}

impl Default for DisconnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers interest in a channel: `/meta/subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    pub subscription: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl SubscribeRequest {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            id: None,
            channel: channel::SUBSCRIBE.to_owned(),
            subscription: subscription.into(),
            client_id: None,
            ext: None,
        }
    }
}

/// Drops interest in a channel: `/meta/unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    pub subscription: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl UnsubscribeRequest {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            id: None,
            channel: channel::UNSUBSCRIBE.to_owned(),
            subscription: subscription.into(),
            client_id: None,
            ext: None,
        }
    }
}

/// An application publish on a non-meta channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl<T> DataMessage<T> {
    pub fn new(channel: impl Into<String>, data: T) -> Self {
        Self {
            id: None,
            channel: channel.into(),
            data,
            client_id: None,
            ext: None,
        }
    }
}

/// A server reply on any meta or application channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}
