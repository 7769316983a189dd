//! Broker that keeps up to `concurrency_level` messages in flight.
//!
//! A slot is taken when a message is requested and held until the message
//! has been processed, so requested plus processing never exceeds the level.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::broker::{KeepRunning, MessageBroker, MessageConsumer, MessageSupplier};
use crate::error::{ListenerError, ProcessingError};
use crate::properties::{
    safely_get, ConcurrentMessageBrokerProperties, DEFAULT_CONCURRENCY_POLLING_RATE,
    DEFAULT_ERROR_BACKOFF_TIME,
};
use crate::retriever::MessageFuture;
use crate::shutdown::{backoff, Shutdown};
use crate::worker::WorkerPool;

const COMPONENT: &str = "concurrent-message-broker";

/// Count of slots in use plus a wake-up for when one is released.
#[derive(Default)]
struct ConcurrencyBudget {
    in_use: AtomicUsize,
    released: Notify,
}

/// Holds one slot of the budget until dropped.
struct Slot {
    budget: Arc<ConcurrencyBudget>,
}

impl Slot {
    fn acquire(budget: &Arc<ConcurrencyBudget>) -> Self {
        budget.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            budget: Arc::clone(budget),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(1, Ordering::SeqCst);
        self.budget.released.notify_waiters();
    }
}

pub struct ConcurrentMessageBroker {
    properties: Arc<dyn ConcurrentMessageBrokerProperties>,
    budget: Arc<ConcurrencyBudget>,
}

impl ConcurrentMessageBroker {
    pub fn new(properties: Arc<dyn ConcurrentMessageBrokerProperties>) -> Self {
        Self {
            properties,
            budget: Arc::new(ConcurrencyBudget::default()),
        }
    }

    /// Slots currently reserved for requested or processing messages.
    pub fn in_use(&self) -> usize {
        self.budget.in_use.load(Ordering::SeqCst)
    }

    async fn back_off(&self, shutdown: &mut Shutdown) -> bool {
        let backoff_time = safely_get(COMPONENT, self.properties.error_backoff_time(), DEFAULT_ERROR_BACKOFF_TIME);
        backoff(backoff_time, shutdown).await.is_ok()
    }
}

async fn process_message(future: MessageFuture, consumer: MessageConsumer) {
    let message = match future.await {
        Ok(message) => message,
        Err(ListenerError::Cancelled) => return,
        Err(e) => {
            error!(error = %e, "Error retrieving message");
            return;
        }
    };

    let message_id = message.id.clone();
    let result = AssertUnwindSafe(async move { consumer(message).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ProcessingError::Panicked(panic_message(panic.as_ref()))));

    match result {
        Ok(()) => debug!(message_id = %message_id, "Message processed"),
        Err(ProcessingError::Interrupted) => {
            info!(message_id = %message_id, "Message processing was interrupted")
        }
        Err(e) => error!(message_id = %message_id, error = %e, "Error processing message"),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl MessageBroker for ConcurrentMessageBroker {
    async fn process_messages(
        &self,
        pool: &WorkerPool,
        keep_running: KeepRunning,
        supplier: MessageSupplier,
        consumer: MessageConsumer,
        mut shutdown: Shutdown,
    ) -> Result<(), ListenerError> {
        debug!("Beginning processing of messages");
        let mut previous_level: Option<usize> = None;

        while keep_running() && !shutdown.is_triggered() {
            let level = safely_get(COMPONENT, self.properties.concurrency_level(), 0);
            if previous_level != Some(level) {
                info!(
                    previous = ?previous_level,
                    concurrency_level = level,
                    "Concurrency level changed"
                );
                previous_level = Some(level);
            }

            let released = self.budget.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.in_use() >= level {
                let polling_rate = safely_get(
                    COMPONENT,
                    self.properties.concurrency_polling_rate(),
                    DEFAULT_CONCURRENCY_POLLING_RATE,
                );
                tokio::select! {
                    _ = &mut released => {}
                    _ = tokio::time::sleep(polling_rate) => {}
                    _ = shutdown.triggered() => break,
                }
                continue;
            }

            let mut future = match supplier() {
                Ok(future) => future,
                Err(e) => {
                    error!(error = %e, "Error requesting message");
                    if !self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            // A future that has already failed is handled here without
            // taking a slot.
            if let Poll::Ready(result) = futures::poll!(&mut future) {
                match result {
                    Ok(message) => future = futures::future::ready(Ok(message)).boxed(),
                    Err(e) => {
                        if !e.is_cancelled() {
                            error!(error = %e, "Error requesting message");
                        }
                        if !self.back_off(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let slot = Slot::acquire(&self.budget);
            let consumer = Arc::clone(&consumer);
            pool.spawn(async move {
                let _slot = slot;
                process_message(future, consumer).await;
            });
        }

        debug!("Ending processing of messages");
        Ok(())
    }
}
