//! Message envelope received from the queue.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// System attribute carrying the FIFO message group.
pub const MESSAGE_GROUP_ID: &str = "MessageGroupId";
/// System attribute carrying the number of times the message was received.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
/// System attribute carrying the send time in epoch millis.
pub const SENT_TIMESTAMP: &str = "SentTimestamp";

/// A message received from the queue.
///
/// Immutable once received. Components clone it as it moves from retriever to
/// broker to processor to resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier from the queue provider.
    pub id: String,
    /// Provider-specific handle used for delete and visibility calls.
    pub receipt_handle: String,
    /// Raw message body.
    pub body: String,
    /// System attributes (e.g. `MessageGroupId`, `SentTimestamp`).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// User-supplied string message attributes.
    #[serde(default)]
    pub message_attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(id: impl Into<String>, receipt_handle: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
        }
    }

    /// Builder-style helper for setting a system attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// The FIFO message group, if the queue supplied one.
    pub fn group_id(&self) -> Option<&str> {
        self.attributes.get(MESSAGE_GROUP_ID).map(String::as_str)
    }

    /// Number of times this message has been received (for retry tracking).
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .get(APPROXIMATE_RECEIVE_COUNT)
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(1)
    }

    /// When the message was sent to the queue, if reported.
    pub fn sent_timestamp(&self) -> Option<DateTime<Utc>> {
        self.attributes
            .get(SENT_TIMESTAMP)
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}
