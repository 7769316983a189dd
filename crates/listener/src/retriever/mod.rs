//! Message retrievers: pull messages from the queue and hand them to
//! whoever asked for one.

pub mod batching;
pub mod prefetching;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::ListenerError;
use crate::message::Message;
use crate::shutdown::Shutdown;

pub use batching::BatchingMessageRetriever;
pub use prefetching::PrefetchingMessageRetriever;

/// A pending receive. Resolves with a message, or [`ListenerError::Cancelled`]
/// if the retriever stops first.
pub type MessageFuture = BoxFuture<'static, Result<Message, ListenerError>>;

#[async_trait]
pub trait MessageRetriever: Send + Sync {
    /// Request a single message.
    fn retrieve_message(&self) -> MessageFuture;

    /// Run the background loop until `shutdown` fires.
    ///
    /// Returns messages that were received but never handed out, for the
    /// caller to dispose of. Pending requests are cancelled on return.
    async fn run(&self, shutdown: Shutdown) -> Result<Vec<Message>, ListenerError>;
}

pub(crate) fn message_future(rx: oneshot::Receiver<Message>) -> MessageFuture {
    Box::pin(async move { rx.await.map_err(|_| ListenerError::Cancelled) })
}
