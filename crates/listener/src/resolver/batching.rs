//! Resolver that batches deletions into `DeleteMessageBatch` calls.
//!
//! Each batch is sent from its own task so the drain loop can keep
//! accumulating while earlier batches are in flight. Every caller's future
//! is completed exactly once: with success, with the per-entry failure the
//! queue reported, or with the error of the whole call.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::batcher::BatchDrain;
use crate::client::{DeleteEntry, QueueClient, MAX_NUMBER_OF_MESSAGES_IN_BATCH};
use crate::error::ListenerError;
use crate::message::Message;
use crate::properties::{safely_get, BatchingMessageResolverProperties, DEFAULT_BUFFERING_TIME};
use crate::resolver::{MessageResolver, ResolutionFuture};
use crate::shutdown::Shutdown;

const COMPONENT: &str = "batching-message-resolver";

type Completion = oneshot::Sender<Result<(), ListenerError>>;

struct PendingResolution {
    message: Message,
    completion: Completion,
}

pub struct BatchingMessageResolver {
    client: Arc<dyn QueueClient>,
    properties: Arc<dyn BatchingMessageResolverProperties>,
    pending_tx: mpsc::UnboundedSender<PendingResolution>,
    pending: Mutex<Option<BatchDrain<PendingResolution>>>,
}

impl BatchingMessageResolver {
    pub fn new(
        client: Arc<dyn QueueClient>,
        properties: Arc<dyn BatchingMessageResolverProperties>,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            client,
            properties,
            pending_tx,
            pending: Mutex::new(Some(BatchDrain::new(pending_rx))),
        }
    }

    fn buffering_size_limit(&self) -> usize {
        safely_get(COMPONENT, self.properties.buffering_size_limit(), 1)
            .clamp(1, MAX_NUMBER_OF_MESSAGES_IN_BATCH)
    }
}

/// Send one delete batch and complete every caller in it.
async fn delete_batch(client: Arc<dyn QueueClient>, batch: Vec<PendingResolution>) {
    // Entries sharing a message id are sent once and share the outcome.
    let mut entries: IndexMap<String, (DeleteEntry, Vec<Completion>)> = IndexMap::new();
    for pending in batch {
        entries
            .entry(pending.message.id.clone())
            .or_insert_with(|| (DeleteEntry::from(&pending.message), Vec::new()))
            .1
            .push(pending.completion);
    }

    let request: Vec<DeleteEntry> = entries.values().map(|(entry, _)| entry.clone()).collect();
    debug!(count = request.len(), "Sending delete batch");

    let result = match client.delete_message_batch(request).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, count = entries.len(), "Error deleting message batch");
            let error = ListenerError::Queue(e);
            for (_, completions) in entries.into_values() {
                for completion in completions {
                    let _ = completion.send(Err(error.clone()));
                }
            }
            return;
        }
    };

    for id in &result.successful {
        if let Some((_, completions)) = entries.swap_remove(id) {
            for completion in completions {
                let _ = completion.send(Ok(()));
            }
        }
    }

    for failure in &result.failed {
        if let Some((_, completions)) = entries.swap_remove(&failure.id) {
            warn!(
                message_id = %failure.id,
                code = %failure.code,
                sender_fault = failure.sender_fault,
                "Message could not be deleted"
            );
            let reason = failure.message.clone().unwrap_or_else(|| failure.code.clone());
            for completion in completions {
                let _ = completion.send(Err(ListenerError::ResolutionFailed {
                    id: failure.id.clone(),
                    reason: reason.clone(),
                }));
            }
        }
    }

    for (id, (_, completions)) in entries {
        error!(message_id = %id, "Delete batch response did not include message");
        for completion in completions {
            let _ = completion.send(Err(ListenerError::Internal(format!(
                "message {id} was missing from the delete batch response"
            ))));
        }
    }
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        if let Err(e) = result {
            error!(error = %e, "Delete batch task failed");
        }
    }
}

#[async_trait]
impl MessageResolver for BatchingMessageResolver {
    fn resolve_message(&self, message: Message) -> ResolutionFuture {
        let (completion, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(pending)) =
            self.pending_tx.send(PendingResolution { message, completion })
        {
            let _ = pending
                .completion
                .send(Err(ListenerError::Stopped("message resolver")));
        }
        Box::pin(async move { rx.await.unwrap_or(Err(ListenerError::Cancelled)) })
    }

    async fn run(&self, mut shutdown: Shutdown) -> Result<(), ListenerError> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ListenerError::Internal("batching resolver can only run once".into()))?;

        info!("Started batching message resolver");

        let mut in_flight = JoinSet::new();

        loop {
            let size = self.buffering_size_limit();
            let buffering_time = safely_get(COMPONENT, self.properties.buffering_time(), DEFAULT_BUFFERING_TIME);

            let drained = pending.drain(size, buffering_time, &mut shutdown).await;
            let interrupted = drained.is_interrupted();
            let batch = drained.into_inner();

            if !batch.is_empty() {
                in_flight.spawn(delete_batch(Arc::clone(&self.client), batch));
            }
            reap_finished(&mut in_flight);

            if interrupted {
                break;
            }
        }

        // No new resolutions are accepted from here on; everything already
        // queued is still sent.
        pending.close();
        let remaining = pending.drain_now();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "Sending queued resolutions before shutdown");
        }
        let size = self.buffering_size_limit();
        let mut remaining = remaining.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch: Vec<PendingResolution> = remaining.by_ref().take(size).collect();
            in_flight.spawn(delete_batch(Arc::clone(&self.client), batch));
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Delete batch task failed");
            }
        }

        info!("Batching message resolver stopped");
        Ok(())
    }
}
