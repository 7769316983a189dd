//! Retriever that keeps a local buffer of messages ahead of demand.
//!
//! The background loop refills the buffer whenever it drops below
//! `desired_min_prefetched_messages`, requesting up to
//! `max_prefetched_messages - buffered` messages per receive call. Buffered
//! messages can outlive their visibility timeout if nobody claims them; they
//! are then redelivered by the queue and the stale copy fails to resolve.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info};

use crate::client::{QueueClient, ReceiveRequest, MAX_NUMBER_OF_MESSAGES_FROM_SQS};
use crate::error::ListenerError;
use crate::message::Message;
use crate::properties::{safely_get, PrefetchingMessageRetrieverProperties, DEFAULT_ERROR_BACKOFF_TIME};
use crate::retriever::{message_future, MessageFuture, MessageRetriever};
use crate::shutdown::{backoff, Interrupted, Shutdown};

const COMPONENT: &str = "prefetching-message-retriever";

#[derive(Default)]
struct BufferState {
    requests: VecDeque<oneshot::Sender<Message>>,
    messages: VecDeque<Message>,
    closed: bool,
}

impl BufferState {
    /// Pair buffered messages with waiting requests. Returns how many
    /// messages were handed out.
    fn match_pending(&mut self) -> usize {
        let mut handed_out = 0;
        while !self.requests.is_empty() {
            let Some(mut message) = self.messages.pop_front() else {
                break;
            };
            loop {
                let Some(request) = self.requests.pop_front() else {
                    self.messages.push_front(message);
                    return handed_out;
                };
                match request.send(message) {
                    Ok(()) => {
                        handed_out += 1;
                        break;
                    }
                    Err(returned) => message = returned,
                }
            }
        }
        handed_out
    }
}

/// Bounded message buffer shared by consumers and the prefetch loop.
struct PrefetchBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    not_full: Notify,
}

impl PrefetchBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity,
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_request(&self, request: oneshot::Sender<Message>) {
        let mut state = self.lock();
        if state.closed {
            // Dropping the sender cancels the request.
            return;
        }
        state.requests.push_back(request);
        if state.match_pending() > 0 {
            self.not_full.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Wait until fewer than `capacity` messages are buffered and return the
    /// current buffer size.
    async fn wait_for_free_slot(&self, shutdown: &mut Shutdown) -> Result<usize, Interrupted> {
        loop {
            let not_full = self.not_full.notified();
            tokio::pin!(not_full);
            not_full.as_mut().enable();

            let buffered = self.len();
            if buffered < self.capacity {
                return Ok(buffered);
            }

            tokio::select! {
                _ = &mut not_full => {}
                _ = shutdown.triggered() => return Err(Interrupted),
            }
        }
    }

    /// Add a message, waiting for room if the buffer is full. On shutdown the
    /// message is handed back.
    async fn push_message(&self, message: Message, shutdown: &mut Shutdown) -> Result<(), Message> {
        loop {
            let not_full = self.not_full.notified();
            tokio::pin!(not_full);
            not_full.as_mut().enable();

            {
                let mut state = self.lock();
                if state.messages.len() < self.capacity {
                    state.messages.push_back(message);
                    state.match_pending();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut not_full => {}
                _ = shutdown.triggered() => return Err(message),
            }
        }
    }

    /// Close the buffer, cancelling waiting requests and returning every
    /// buffered message.
    fn close(&self) -> Vec<Message> {
        let mut state = self.lock();
        state.closed = true;
        state.requests.clear();
        state.messages.drain(..).collect()
    }
}

pub struct PrefetchingMessageRetriever {
    client: Arc<dyn QueueClient>,
    properties: Arc<dyn PrefetchingMessageRetrieverProperties>,
    max_prefetched_messages: usize,
    buffer: PrefetchBuffer,
    started: AtomicBool,
}

impl std::fmt::Debug for PrefetchingMessageRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchingMessageRetriever")
            .field("desired_min_prefetched_messages", &self.buffer.capacity)
            .field("max_prefetched_messages", &self.max_prefetched_messages)
            .finish()
    }
}

impl PrefetchingMessageRetriever {
    /// Fails unless `max_prefetched_messages >= desired_min_prefetched_messages > 0`.
    pub fn new(
        client: Arc<dyn QueueClient>,
        properties: Arc<dyn PrefetchingMessageRetrieverProperties>,
    ) -> Result<Self, ListenerError> {
        let desired_min = properties.desired_min_prefetched_messages()?;
        let max = properties.max_prefetched_messages()?;

        if desired_min == 0 {
            return Err(ListenerError::Configuration(
                "desired_min_prefetched_messages must be greater than zero".into(),
            ));
        }
        if max < desired_min {
            return Err(ListenerError::Configuration(format!(
                "max_prefetched_messages ({max}) must be at least desired_min_prefetched_messages ({desired_min})"
            )));
        }

        Ok(Self {
            client,
            properties,
            max_prefetched_messages: max,
            buffer: PrefetchBuffer::new(desired_min),
            started: AtomicBool::new(false),
        })
    }

    fn number_to_request(&self, buffered: usize) -> usize {
        MAX_NUMBER_OF_MESSAGES_FROM_SQS.min(self.max_prefetched_messages.saturating_sub(buffered))
    }
}

#[async_trait]
impl MessageRetriever for PrefetchingMessageRetriever {
    fn retrieve_message(&self) -> MessageFuture {
        let (tx, rx) = oneshot::channel();
        self.buffer.push_request(tx);
        message_future(rx)
    }

    async fn run(&self, mut shutdown: Shutdown) -> Result<Vec<Message>, ListenerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::Internal("prefetching retriever can only run once".into()));
        }

        info!(
            desired_min = self.buffer.capacity,
            max = self.max_prefetched_messages,
            "Started prefetching message retriever"
        );

        let mut spill = Vec::new();

        'prefetch: loop {
            let buffered = match self.buffer.wait_for_free_slot(&mut shutdown).await {
                Ok(buffered) => buffered,
                Err(Interrupted) => break,
            };

            let count = self.number_to_request(buffered);
            let visibility = safely_get(COMPONENT, self.properties.message_visibility_timeout(), None);
            let request = ReceiveRequest::new(count).with_visibility_timeout(visibility);

            debug!(buffered, requested = count, "Prefetching messages");

            let result = tokio::select! {
                _ = shutdown.triggered() => break,
                result = self.client.receive_messages(request) => result,
            };

            match result {
                Ok(messages) => {
                    let mut messages = messages.into_iter();
                    while let Some(message) = messages.next() {
                        if let Err(message) = self.buffer.push_message(message, &mut shutdown).await {
                            spill.push(message);
                            spill.extend(messages);
                            break 'prefetch;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error prefetching messages");
                    let backoff_time =
                        safely_get(COMPONENT, self.properties.error_backoff_time(), DEFAULT_ERROR_BACKOFF_TIME);
                    if backoff(backoff_time, &mut shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }

        let mut leftover = self.buffer.close();
        leftover.extend(spill);

        info!(
            leftover = leftover.len(),
            "Prefetching message retriever stopped"
        );

        Ok(leftover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::StaticPrefetchingMessageRetrieverProperties;
    use crate::client::{BatchResult, DeleteEntry, VisibilityEntry};
    use crate::error::QueueError;

    struct NoopClient;

    #[async_trait]
    impl QueueClient for NoopClient {
        async fn receive_messages(&self, _request: ReceiveRequest) -> Result<Vec<Message>, QueueError> {
            Ok(Vec::new())
        }

        async fn delete_message_batch(&self, _entries: Vec<DeleteEntry>) -> Result<BatchResult, QueueError> {
            Ok(BatchResult::default())
        }

        async fn change_visibility_batch(
            &self,
            _entries: Vec<VisibilityEntry>,
        ) -> Result<BatchResult, QueueError> {
            Ok(BatchResult::default())
        }
    }

    fn properties(desired: usize, max: usize) -> Arc<dyn PrefetchingMessageRetrieverProperties> {
        Arc::new(StaticPrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: desired,
            max_prefetched_messages: max,
            ..Default::default()
        })
    }

    #[test]
    fn test_rejects_zero_desired_min() {
        let result = PrefetchingMessageRetriever::new(Arc::new(NoopClient), properties(0, 5));
        assert!(matches!(result, Err(ListenerError::Configuration(_))));
    }

    #[test]
    fn test_rejects_max_below_desired_min() {
        let result = PrefetchingMessageRetriever::new(Arc::new(NoopClient), properties(5, 4));
        assert!(matches!(result, Err(ListenerError::Configuration(_))));
    }

    #[test]
    fn test_number_to_request_capped() {
        let retriever = PrefetchingMessageRetriever::new(Arc::new(NoopClient), properties(2, 30)).unwrap();
        assert_eq!(retriever.number_to_request(0), 10);
        assert_eq!(retriever.number_to_request(25), 5);

        let retriever = PrefetchingMessageRetriever::new(Arc::new(NoopClient), properties(2, 4)).unwrap();
        assert_eq!(retriever.number_to_request(1), 3);
    }

    #[tokio::test]
    async fn test_buffered_message_served_immediately() {
        let buffer = PrefetchBuffer::new(2);
        let mut shutdown = Shutdown::never();
        buffer
            .push_message(Message::new("a", "h", ""), &mut shutdown)
            .await
            .unwrap();
        assert_eq!(buffer.len(), 1);

        let (tx, rx) = oneshot::channel();
        buffer.push_request(tx);
        assert_eq!(rx.await.unwrap().id, "a");
        assert_eq!(buffer.len(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_requests_and_returns_messages() {
        let buffer = PrefetchBuffer::new(1);
        let (tx, rx) = oneshot::channel();
        buffer.push_request(tx);

        let leftover = buffer.close();
        assert!(leftover.is_empty());
        assert!(rx.await.is_err());

        let (tx, rx) = oneshot::channel();
        buffer.push_request(tx);
        assert!(rx.await.is_err());
    }
}
