//! JSON-array framing.
//!
//! Bayeux batches messages into JSON arrays. This client always sends
//! one-element batches; inbound frames may carry any number of messages.

use serde_json::Value;

/// Wraps a single message in a one-element array and encodes it.
pub fn encode(msg: Value) -> String {
    Value::Array(vec![msg]).to_string()
}

/// Decodes an inbound frame into its messages, in wire order.
///
/// A frame that is valid JSON but not an array is rejected.
pub fn decode(text: &str) -> Result<Vec<Value>, serde_json::Error> {
    serde_json::from_str::<Vec<Value>>(text)
}
