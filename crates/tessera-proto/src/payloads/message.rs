//! Application message payload.

use serde::{Deserialize, Serialize};

/// A message addressed to a destination.
///
/// The transport core does not interpret `body`. It reads `destination` for
/// bridge filtering and `broker_path` for loop prevention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Producer-assigned id
    pub message_id: String,
    /// Dot-separated destination name, e.g. `orders.eu.new`
    pub destination: String,
    /// Opaque body
    pub body: Vec<u8>,
    /// Brokers this message has traversed, oldest first
    #[serde(default)]
    pub broker_path: Vec<String>,
}

impl Message {
    /// Create a message that has not crossed any broker yet.
    pub fn new(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            destination: destination.into(),
            body: body.into(),
            broker_path: Vec::new(),
        }
    }

    /// True if `broker` already handled this message.
    #[must_use]
    pub fn has_visited(&self, broker: &str) -> bool {
        self.broker_path.iter().any(|b| b == broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_visited_checks_path() {
        let mut message = Message::new("m-1", "orders.new", b"hi".to_vec());
        assert!(!message.has_visited("broker-a"));
        message.broker_path.push("broker-a".into());
        assert!(message.has_visited("broker-a"));
        assert!(!message.has_visited("broker-b"));
    }
}
