//! Broker that never processes two messages of the same group at once.
//!
//! Messages are pulled ahead of demand into a per-group cache. A message is
//! handed to the underlying [`ConcurrentMessageBroker`] only when no other
//! message of its group is processing; when one finishes, the next cached
//! message of that group is dispatched straight away.
//!
//! When `maximum_number_of_cached_message_groups` groups are cached (counting
//! retrievals still in flight), no further retrieval is issued until a group
//! drains.
//!
//! Retrievals complete on separate tasks but are applied to the cache in the
//! order they were issued, so messages of one group keep their queue order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace};

use crate::broker::concurrent::ConcurrentMessageBroker;
use crate::broker::{KeepRunning, MessageBroker, MessageConsumer, MessageSupplier};
use crate::error::{ListenerError, PropertyError};
use crate::message::Message;
use crate::properties::{safely_get, ConcurrentMessageBrokerProperties, GroupingMessageBrokerProperties};
use crate::retriever::{message_future, MessageFuture};
use crate::shutdown::Shutdown;
use crate::worker::WorkerPool;

const COMPONENT: &str = "grouping-message-broker";

/// Window after a failure during which new messages of the failed group are dropped.
const FAILED_GROUP_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct GroupState {
    /// Messages waiting for their group to free up, in group arrival order.
    cache: IndexMap<String, VecDeque<Message>>,
    /// Groups with a message currently processing.
    processing: HashSet<String>,
    /// Requests from the concurrent broker waiting for a dispatchable message.
    delegate_requests: VecDeque<oneshot::Sender<Message>>,
    /// Retrievals in flight against the real supplier.
    retrievals: HashMap<u64, AbortHandle>,
    /// Finished retrievals waiting for an earlier one to finish.
    arrived: BTreeMap<u64, Result<Message, ListenerError>>,
    next_retrieval: u64,
    next_to_apply: u64,
    failed_groups: HashMap<String, Instant>,
    retrieval_enabled: bool,
}

impl GroupState {
    /// Take the first cached message whose group is free and mark the group busy.
    fn take_available(&mut self) -> Option<(String, Message)> {
        let (index, group) = self
            .cache
            .keys()
            .enumerate()
            .find(|(_, group)| !self.processing.contains(*group))
            .map(|(index, group)| (index, group.clone()))?;

        let queue = &mut self.cache[index];
        let message = queue.pop_front()?;
        if queue.is_empty() {
            self.cache.shift_remove_index(index);
        }
        self.processing.insert(group.clone());
        Some((group, message))
    }

    /// Give a cached message to a waiting delegate request, if both exist.
    fn try_process_another(&mut self) {
        while !self.delegate_requests.is_empty() {
            let Some((group, message)) = self.take_available() else {
                return;
            };
            let Some(request) = self.delegate_requests.pop_front() else {
                self.restore(group, message);
                return;
            };
            trace!(group = %group, message_id = %message.id, "Dispatching cached message");
            if let Err(message) = request.send(message) {
                self.restore(group, message);
            }
        }
    }

    /// Undo [`take_available`](Self::take_available).
    fn restore(&mut self, group: String, message: Message) {
        self.processing.remove(&group);
        match self.cache.get_mut(&group) {
            Some(queue) => queue.push_front(message),
            None => {
                self.cache.shift_insert(0, group, VecDeque::from([message]));
            }
        }
    }

    /// Retrieved messages not yet in the cache count against its capacity.
    fn occupied(&self) -> usize {
        self.cache.len() + self.retrievals.len() + self.arrived.len()
    }

    /// Take the arrived results that are next in issue order.
    fn take_in_order(&mut self) -> Vec<Result<Message, ListenerError>> {
        let mut ready = Vec::new();
        while let Some(result) = self.arrived.remove(&self.next_to_apply) {
            self.next_to_apply += 1;
            ready.push(result);
        }
        ready
    }

    /// Take every arrived result regardless of gaps left by aborted retrievals.
    fn take_all_arrived(&mut self) -> Vec<Result<Message, ListenerError>> {
        self.next_to_apply = self.next_retrieval;
        std::mem::take(&mut self.arrived).into_values().collect()
    }

    fn recently_failed(&mut self, group: &str) -> bool {
        match self.failed_groups.get(group) {
            Some(failed_at) if failed_at.elapsed() < FAILED_GROUP_WINDOW => true,
            Some(_) => {
                self.failed_groups.remove(group);
                false
            }
            None => false,
        }
    }
}

struct GroupingInner {
    properties: Arc<dyn GroupingMessageBrokerProperties>,
    state: Mutex<GroupState>,
}

impl GroupingInner {
    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maximum_cached_groups(&self) -> usize {
        safely_get(
            COMPONENT,
            self.properties.maximum_number_of_cached_message_groups(),
            1,
        )
        .max(1)
    }

    /// Start another retrieval if there is room in the cache.
    fn perform_retrieval(
        self: &Arc<Self>,
        state: &mut GroupState,
        supplier: &MessageSupplier,
    ) -> Result<(), ListenerError> {
        if !state.retrieval_enabled {
            return Ok(());
        }
        if state.occupied() >= self.maximum_cached_groups() {
            return Ok(());
        }

        let future = supplier()?;
        let id = state.next_retrieval;
        state.next_retrieval += 1;
        let inner = Arc::clone(self);
        let supplier = Arc::clone(supplier);
        let handle = tokio::spawn(async move {
            let result = future.await;
            inner.on_retrieved(id, result, &supplier);
        });
        state.retrievals.insert(id, handle.abort_handle());
        Ok(())
    }

    fn on_retrieved(
        self: &Arc<Self>,
        id: u64,
        result: Result<Message, ListenerError>,
        supplier: &MessageSupplier,
    ) {
        let mut state = self.lock();
        state.retrievals.remove(&id);

        let ready = if id < state.next_to_apply {
            // Arrived after the retrievals were stopped and flushed.
            vec![result]
        } else {
            state.arrived.insert(id, result);
            state.take_in_order()
        };
        for result in ready {
            self.accept(&mut state, result);
        }

        state.try_process_another();

        if let Err(e) = self.perform_retrieval(&mut state, supplier) {
            error!(error = %e, "Error requesting message for grouping");
        }
    }

    fn accept(&self, state: &mut GroupState, result: Result<Message, ListenerError>) {
        let message = match result {
            Ok(message) => message,
            Err(ListenerError::Cancelled) => return,
            Err(e) => {
                error!(error = %e, "Error retrieving message for grouping");
                return;
            }
        };

        let group = self.properties.message_group(&message);
        if state.recently_failed(&group) {
            debug!(
                group = %group,
                message_id = %message.id,
                "Dropping message for recently failed group"
            );
        } else {
            state.cache.entry(group).or_default().push_back(message);
        }
    }

    fn supply(
        self: &Arc<Self>,
        supplier: &MessageSupplier,
        with_retrieval: bool,
    ) -> Result<MessageFuture, ListenerError> {
        let mut state = self.lock();

        if state.delegate_requests.is_empty() {
            if let Some((_, message)) = state.take_available() {
                return Ok(futures::future::ready(Ok(message)).boxed());
            }
        }

        if with_retrieval {
            self.perform_retrieval(&mut state, supplier)?;
        }

        let (tx, rx) = oneshot::channel();
        state.delegate_requests.push_back(tx);
        Ok(message_future(rx))
    }

    fn on_processed(&self, group: &str, failed: bool) {
        let mut state = self.lock();
        if failed && self.properties.purge_extra_messages_in_group_on_error() {
            state.failed_groups.insert(group.to_string(), Instant::now());
            if let Some(purged) = state.cache.shift_remove(group) {
                debug!(group, purged = purged.len(), "Purged cached messages for failed group");
            }
        }
        state.processing.remove(group);
        state.try_process_another();
    }
}

/// Marks a group free when processing ends, including by panic or abort.
struct GroupCompletion {
    inner: Arc<GroupingInner>,
    group: String,
    failed: bool,
}

impl Drop for GroupCompletion {
    fn drop(&mut self) {
        let failed = self.failed || std::thread::panicking();
        self.inner.on_processed(&self.group, failed);
    }
}

/// Exposes the concurrency half of the grouping properties to the inner broker.
struct ConcurrencyProperties(Arc<dyn GroupingMessageBrokerProperties>);

impl ConcurrentMessageBrokerProperties for ConcurrencyProperties {
    fn concurrency_level(&self) -> Result<usize, PropertyError> {
        self.0.concurrency_level()
    }

    fn concurrency_polling_rate(&self) -> Result<Duration, PropertyError> {
        self.0.concurrency_polling_rate()
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        self.0.error_backoff_time()
    }
}

pub struct GroupingMessageBroker {
    inner: Arc<GroupingInner>,
    concurrent: ConcurrentMessageBroker,
}

impl GroupingMessageBroker {
    pub fn new(properties: Arc<dyn GroupingMessageBrokerProperties>) -> Self {
        let concurrent = ConcurrentMessageBroker::new(Arc::new(ConcurrencyProperties(Arc::clone(&properties))));
        Self {
            inner: Arc::new(GroupingInner {
                properties,
                state: Mutex::new(GroupState::default()),
            }),
            concurrent,
        }
    }

    /// Number of groups that currently have cached messages.
    pub fn cached_groups(&self) -> usize {
        self.inner.lock().cache.len()
    }

    fn wrap_supplier(&self, supplier: &MessageSupplier, with_retrieval: bool) -> MessageSupplier {
        let inner = Arc::clone(&self.inner);
        let supplier = Arc::clone(supplier);
        Arc::new(move || inner.supply(&supplier, with_retrieval))
    }

    fn wrap_consumer(&self, consumer: &MessageConsumer) -> MessageConsumer {
        let inner = Arc::clone(&self.inner);
        let consumer = Arc::clone(consumer);
        Arc::new(move |message: Message| {
            let mut completion = GroupCompletion {
                group: inner.properties.message_group(&message),
                inner: Arc::clone(&inner),
                failed: false,
            };
            let processing = consumer(message);
            async move {
                let result = processing.await;
                completion.failed = result.is_err();
                result
            }
            .boxed()
        })
    }

    fn stop_retrievals(&self) {
        let mut state = self.inner.lock();
        state.retrieval_enabled = false;
        for (_, handle) in state.retrievals.drain() {
            handle.abort();
        }
        for result in state.take_all_arrived() {
            self.inner.accept(&mut state, result);
        }
        // Requests left over from the first phase still hold concurrency slots.
        state.try_process_another();
    }
}

#[async_trait]
impl MessageBroker for GroupingMessageBroker {
    async fn process_messages(
        &self,
        pool: &WorkerPool,
        keep_running: KeepRunning,
        supplier: MessageSupplier,
        consumer: MessageConsumer,
        shutdown: Shutdown,
    ) -> Result<(), ListenerError> {
        self.inner.lock().retrieval_enabled = true;
        let consumer = self.wrap_consumer(&consumer);

        let result = self
            .concurrent
            .process_messages(
                pool,
                keep_running,
                self.wrap_supplier(&supplier, true),
                Arc::clone(&consumer),
                shutdown,
            )
            .await;

        self.stop_retrievals();

        if self.inner.properties.process_cached_messages_on_shutdown() {
            debug!(cached_groups = self.cached_groups(), "Processing cached messages before shutdown");
            let inner = Arc::clone(&self.inner);
            let has_cached: KeepRunning = Arc::new(move || !inner.lock().cache.is_empty());
            self.concurrent
                .process_messages(
                    pool,
                    has_cached,
                    self.wrap_supplier(&supplier, false),
                    consumer,
                    Shutdown::never(),
                )
                .await?;
        }

        // Requests left unanswered are cancelled so their workers finish.
        let mut state = self.inner.lock();
        state.delegate_requests.clear();
        debug!(abandoned_groups = state.cache.len(), "Grouping broker stopped");

        result
    }
}
