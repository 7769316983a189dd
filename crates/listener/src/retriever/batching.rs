//! Retriever that batches consumer requests into receive calls.
//!
//! Requests accumulate until `batch_size` are waiting or `batching_period`
//! has passed since the drain started, then one receive call sized to the
//! batch is issued. Messages are handed out in request order.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::batcher::BatchDrain;
use crate::client::{QueueClient, ReceiveRequest, MAX_NUMBER_OF_MESSAGES_FROM_SQS};
use crate::error::ListenerError;
use crate::message::Message;
use crate::properties::{
    safely_get, BatchingMessageRetrieverProperties, DEFAULT_BATCHING_PERIOD,
    DEFAULT_ERROR_BACKOFF_TIME,
};
use crate::retriever::{message_future, MessageFuture, MessageRetriever};
use crate::shutdown::{backoff, Shutdown};

const COMPONENT: &str = "batching-message-retriever";

type PendingReceive = oneshot::Sender<Message>;

pub struct BatchingMessageRetriever {
    client: Arc<dyn QueueClient>,
    properties: Arc<dyn BatchingMessageRetrieverProperties>,
    requests_tx: mpsc::UnboundedSender<PendingReceive>,
    requests: Mutex<Option<BatchDrain<PendingReceive>>>,
}

impl BatchingMessageRetriever {
    pub fn new(
        client: Arc<dyn QueueClient>,
        properties: Arc<dyn BatchingMessageRetrieverProperties>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            client,
            properties,
            requests_tx,
            requests: Mutex::new(Some(BatchDrain::new(requests_rx))),
        }
    }

    fn batch_size(&self) -> usize {
        let size = safely_get(COMPONENT, self.properties.batch_size(), 1);
        size.clamp(1, MAX_NUMBER_OF_MESSAGES_FROM_SQS)
    }
}

/// Hand messages to waiting requests in order, skipping requests whose
/// consumer has gone away. Returns the requests that are still waiting.
fn complete_requests(waiting: Vec<PendingReceive>, messages: Vec<Message>) -> Vec<PendingReceive> {
    let mut waiting = waiting.into_iter();

    'messages: for mut message in messages {
        for request in waiting.by_ref() {
            match request.send(message) {
                Ok(()) => continue 'messages,
                Err(returned) => message = returned,
            }
        }
        warn!(
            message_id = %message.id,
            "Received more messages than pending requests, message will be redelivered"
        );
    }

    waiting.collect()
}

#[async_trait]
impl MessageRetriever for BatchingMessageRetriever {
    fn retrieve_message(&self) -> MessageFuture {
        let (tx, rx) = oneshot::channel();
        // A send error drops `tx`, which cancels the future.
        let _ = self.requests_tx.send(tx);
        message_future(rx)
    }

    async fn run(&self, mut shutdown: Shutdown) -> Result<Vec<Message>, ListenerError> {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ListenerError::Internal("batching retriever can only run once".into()))?;

        info!("Started batching message retriever");

        loop {
            let batch_size = self.batch_size();
            let period = safely_get(COMPONENT, self.properties.batching_period(), DEFAULT_BATCHING_PERIOD);

            let drained = requests.drain(batch_size, period, &mut shutdown).await;
            if drained.is_interrupted() {
                break;
            }

            let waiting: Vec<PendingReceive> = drained
                .into_inner()
                .into_iter()
                .filter(|request| !request.is_closed())
                .collect();
            if waiting.is_empty() {
                continue;
            }

            let visibility = safely_get(COMPONENT, self.properties.message_visibility_timeout(), None);
            let request = ReceiveRequest::new(waiting.len()).with_visibility_timeout(visibility);

            debug!(requested = waiting.len(), "Requesting messages");

            let result = tokio::select! {
                _ = shutdown.triggered() => break,
                result = self.client.receive_messages(request) => result,
            };

            match result {
                Ok(messages) => {
                    debug!(received = messages.len(), "Received messages");
                    let leftover = complete_requests(waiting, messages);
                    requests.push_front(leftover);
                }
                Err(e) => {
                    error!(error = %e, "Error retrieving messages");
                    requests.push_front(waiting);
                    let backoff_time =
                        safely_get(COMPONENT, self.properties.error_backoff_time(), DEFAULT_ERROR_BACKOFF_TIME);
                    if backoff(backoff_time, &mut shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            cancelled = requests.pushed_back_len(),
            "Batching message retriever stopped"
        );

        // Dropping `requests` cancels every request still queued.
        Ok(Vec::new())
    }
}
