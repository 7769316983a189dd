//! Queue client trait and request/response types.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::message::Message;

/// The maximum number of messages a single receive call may return.
pub const MAX_NUMBER_OF_MESSAGES_FROM_SQS: usize = 10;

/// The maximum number of entries in a delete or change-visibility batch.
pub const MAX_NUMBER_OF_MESSAGES_IN_BATCH: usize = 10;

/// The longest long-poll a receive call may request.
pub const MAX_RECEIVE_WAIT_TIME: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Number of messages wanted, `1..=MAX_NUMBER_OF_MESSAGES_FROM_SQS`.
    pub max_messages: usize,
    /// Overrides the queue's visibility timeout for the returned messages.
    pub visibility_timeout: Option<Duration>,
    pub wait_time: Duration,
}

impl ReceiveRequest {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_NUMBER_OF_MESSAGES_FROM_SQS),
            visibility_timeout: None,
            wait_time: MAX_RECEIVE_WAIT_TIME,
        }
    }

    /// Only positive timeouts are applied, anything else keeps the queue default.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Option<Duration>) -> Self {
        self.visibility_timeout = visibility_timeout.filter(|timeout| timeout.as_secs() > 0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl From<&Message> for DeleteEntry {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            receipt_handle: message.receipt_handle.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// Per-entry outcome of a batch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn all_successful<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            successful: ids.into_iter().map(Into::into).collect(),
            failed: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Network operations the runtime needs from the queue service.
///
/// Every call may fail; callers treat failures as transient.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `request.max_messages` messages.
    ///
    /// May block for up to `request.wait_time`. Returns an empty vec if no
    /// messages are available.
    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>, QueueError>;

    /// Delete a batch of messages, reporting per-entry success or failure.
    async fn delete_message_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchResult, QueueError>;

    /// Change the visibility timeout of a batch of messages.
    async fn change_visibility_batch(
        &self,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult, QueueError>;
}
