//! Message resolvers: acknowledge (delete) processed messages.

pub mod batching;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::ListenerError;
use crate::message::Message;
use crate::shutdown::Shutdown;

pub use batching::BatchingMessageResolver;

/// Completes once the queue has confirmed or rejected the deletion.
pub type ResolutionFuture = BoxFuture<'static, Result<(), ListenerError>>;

#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// Queue `message` for deletion.
    fn resolve_message(&self, message: Message) -> ResolutionFuture;

    /// Run the background loop until `shutdown` fires. Every resolution
    /// requested before then is completed before this returns.
    async fn run(&self, shutdown: Shutdown) -> Result<(), ListenerError>;
}
