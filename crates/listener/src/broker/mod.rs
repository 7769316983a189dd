//! Message brokers: match retrieved messages to processing capacity.

pub mod concurrent;
pub mod grouping;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{ListenerError, ProcessingError};
use crate::message::Message;
use crate::retriever::MessageFuture;
use crate::shutdown::Shutdown;
use crate::worker::WorkerPool;

pub use concurrent::ConcurrentMessageBroker;
pub use grouping::GroupingMessageBroker;

/// Checked before every request; the broker returns once it yields `false`.
pub type KeepRunning = Arc<dyn Fn() -> bool + Send + Sync>;

/// Produces the next pending message. An `Err` is treated like a failed future.
pub type MessageSupplier = Arc<dyn Fn() -> Result<MessageFuture, ListenerError> + Send + Sync>;

/// Processes one message to completion.
pub type MessageConsumer =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), ProcessingError>> + Send + Sync>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Request messages from `supplier` and dispatch them to `consumer` on
    /// `pool` until `keep_running` returns `false` or `shutdown` fires.
    ///
    /// Dispatched work is not awaited; draining the pool is the caller's job.
    async fn process_messages(
        &self,
        pool: &WorkerPool,
        keep_running: KeepRunning,
        supplier: MessageSupplier,
        consumer: MessageConsumer,
        shutdown: Shutdown,
    ) -> Result<(), ListenerError>;
}
