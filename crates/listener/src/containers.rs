//! Ready-made container configurations.
//!
//! - [`batching_container`]: batching retriever, concurrent broker, resolver
//!   batching on the same size and period as the retriever.
//! - [`prefetching_container`]: prefetching retriever, concurrent broker.
//! - [`fifo_container`]: batching retriever sized to one message group,
//!   grouping broker on `MessageGroupId`, deletes sent immediately.

use std::sync::Arc;
use std::time::Duration;

use sqs_listener_core::{ListenerConfig, ListenerKind, QueueConfig};

use crate::broker::{ConcurrentMessageBroker, GroupingMessageBroker, MessageBroker};
use crate::client::QueueClient;
use crate::container::MessageListenerContainer;
use crate::error::ListenerError;
use crate::processor::MessageProcessor;
use crate::properties::{
    ContainerProperties, StaticBatchingMessageResolverProperties, StaticBatchingMessageRetrieverProperties,
    StaticConcurrentMessageBrokerProperties, StaticGroupingMessageBrokerProperties,
    StaticPrefetchingMessageRetrieverProperties, DEFAULT_BUFFERING_TIME, DEFAULT_CONCURRENCY_POLLING_RATE,
    DEFAULT_ERROR_BACKOFF_TIME,
};
use crate::resolver::{BatchingMessageResolver, MessageResolver};
use crate::retriever::{BatchingMessageRetriever, MessageRetriever, PrefetchingMessageRetriever};

const FIFO_BATCHING_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BatchingContainerProperties {
    pub concurrency_level: usize,
    pub concurrency_polling_rate: Duration,
    /// Messages per receive call; also the resolver's buffering size.
    pub batch_size: usize,
    /// Also the resolver's buffering time.
    pub batching_period: Duration,
    pub message_visibility_timeout: Option<Duration>,
    pub error_backoff_time: Duration,
    pub interrupt_processing_on_shutdown: bool,
    pub process_extra_retrieved_messages_on_shutdown: bool,
}

impl Default for BatchingContainerProperties {
    fn default() -> Self {
        Self {
            concurrency_level: 5,
            concurrency_polling_rate: DEFAULT_CONCURRENCY_POLLING_RATE,
            batch_size: 5,
            batching_period: Duration::from_secs(2),
            message_visibility_timeout: None,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
            interrupt_processing_on_shutdown: false,
            process_extra_retrieved_messages_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrefetchingContainerProperties {
    pub concurrency_level: usize,
    pub concurrency_polling_rate: Duration,
    pub desired_min_prefetched_messages: usize,
    pub max_prefetched_messages: usize,
    pub message_visibility_timeout: Option<Duration>,
    pub error_backoff_time: Duration,
    pub resolver_buffering_size_limit: usize,
    pub resolver_buffering_time: Duration,
    pub interrupt_processing_on_shutdown: bool,
    pub process_extra_retrieved_messages_on_shutdown: bool,
}

impl Default for PrefetchingContainerProperties {
    fn default() -> Self {
        Self {
            concurrency_level: 5,
            concurrency_polling_rate: DEFAULT_CONCURRENCY_POLLING_RATE,
            desired_min_prefetched_messages: 10,
            max_prefetched_messages: 20,
            message_visibility_timeout: None,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
            resolver_buffering_size_limit: 1,
            resolver_buffering_time: DEFAULT_BUFFERING_TIME,
            interrupt_processing_on_shutdown: false,
            process_extra_retrieved_messages_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FifoContainerProperties {
    pub concurrency_level: usize,
    pub concurrency_polling_rate: Duration,
    /// Receive batch size: how many messages of one group can arrive together.
    pub maximum_messages_in_message_group: usize,
    pub maximum_cached_message_groups: usize,
    pub message_visibility_timeout: Option<Duration>,
    pub error_backoff_time: Duration,
    /// Let the grouping broker finish its cached groups on shutdown.
    pub try_and_process_any_extra_retrieved_messages_on_shutdown: bool,
    pub interrupt_processing_on_shutdown: bool,
}

impl Default for FifoContainerProperties {
    fn default() -> Self {
        Self {
            concurrency_level: 5,
            concurrency_polling_rate: DEFAULT_CONCURRENCY_POLLING_RATE,
            maximum_messages_in_message_group: 2,
            maximum_cached_message_groups: 10,
            message_visibility_timeout: None,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
            try_and_process_any_extra_retrieved_messages_on_shutdown: false,
            interrupt_processing_on_shutdown: false,
        }
    }
}

fn resolver_factory(
    client: &Arc<dyn QueueClient>,
    properties: StaticBatchingMessageResolverProperties,
) -> impl Fn() -> Result<Arc<dyn MessageResolver>, ListenerError> + Send + Sync + 'static {
    let client = Arc::clone(client);
    let properties = Arc::new(properties);
    move || {
        let resolver: Arc<dyn MessageResolver> =
            Arc::new(BatchingMessageResolver::new(Arc::clone(&client), properties.clone()));
        Ok(resolver)
    }
}

fn concurrent_broker_factory(
    properties: StaticConcurrentMessageBrokerProperties,
) -> impl Fn() -> Result<Arc<dyn MessageBroker>, ListenerError> + Send + Sync + 'static {
    let properties = Arc::new(properties);
    move || {
        let broker: Arc<dyn MessageBroker> = Arc::new(ConcurrentMessageBroker::new(properties.clone()));
        Ok(broker)
    }
}

pub fn batching_container(
    identifier: impl Into<String>,
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    properties: BatchingContainerProperties,
) -> Result<MessageListenerContainer, ListenerError> {
    let retriever_properties = Arc::new(StaticBatchingMessageRetrieverProperties {
        batch_size: properties.batch_size,
        batching_period: properties.batching_period,
        message_visibility_timeout: properties.message_visibility_timeout,
        error_backoff_time: properties.error_backoff_time,
    });
    let retriever_client = Arc::clone(&client);

    MessageListenerContainer::builder(identifier)
        .properties(ContainerProperties {
            interrupt_processing_on_shutdown: properties.interrupt_processing_on_shutdown,
            process_extra_retrieved_messages_on_shutdown: properties.process_extra_retrieved_messages_on_shutdown,
            ..ContainerProperties::default()
        })
        .retriever(move || {
            let retriever: Arc<dyn MessageRetriever> = Arc::new(BatchingMessageRetriever::new(
                Arc::clone(&retriever_client),
                retriever_properties.clone(),
            ));
            Ok(retriever)
        })
        .broker(concurrent_broker_factory(StaticConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level,
            concurrency_polling_rate: properties.concurrency_polling_rate,
            error_backoff_time: properties.error_backoff_time,
        }))
        .resolver(resolver_factory(
            &client,
            StaticBatchingMessageResolverProperties {
                buffering_size_limit: properties.batch_size,
                buffering_time: properties.batching_period,
            },
        ))
        .processor(move || Ok(Arc::clone(&processor)))
        .build()
}

pub fn prefetching_container(
    identifier: impl Into<String>,
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    properties: PrefetchingContainerProperties,
) -> Result<MessageListenerContainer, ListenerError> {
    let retriever_properties = Arc::new(StaticPrefetchingMessageRetrieverProperties {
        desired_min_prefetched_messages: properties.desired_min_prefetched_messages,
        max_prefetched_messages: properties.max_prefetched_messages,
        message_visibility_timeout: properties.message_visibility_timeout,
        error_backoff_time: properties.error_backoff_time,
    });
    let retriever_client = Arc::clone(&client);

    MessageListenerContainer::builder(identifier)
        .properties(ContainerProperties {
            interrupt_processing_on_shutdown: properties.interrupt_processing_on_shutdown,
            process_extra_retrieved_messages_on_shutdown: properties.process_extra_retrieved_messages_on_shutdown,
            ..ContainerProperties::default()
        })
        .retriever(move || {
            let retriever: Arc<dyn MessageRetriever> = Arc::new(PrefetchingMessageRetriever::new(
                Arc::clone(&retriever_client),
                retriever_properties.clone(),
            )?);
            Ok(retriever)
        })
        .broker(concurrent_broker_factory(StaticConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level,
            concurrency_polling_rate: properties.concurrency_polling_rate,
            error_backoff_time: properties.error_backoff_time,
        }))
        .resolver(resolver_factory(
            &client,
            StaticBatchingMessageResolverProperties {
                buffering_size_limit: properties.resolver_buffering_size_limit,
                buffering_time: properties.resolver_buffering_time,
            },
        ))
        .processor(move || Ok(Arc::clone(&processor)))
        .build()
}

/// Messages of one group are processed one at a time, in order. The
/// container itself never reprocesses extra retrieved messages; the grouping
/// broker decides what happens to its cache on shutdown.
pub fn fifo_container(
    identifier: impl Into<String>,
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    properties: FifoContainerProperties,
) -> Result<MessageListenerContainer, ListenerError> {
    let retriever_properties = Arc::new(StaticBatchingMessageRetrieverProperties {
        batch_size: properties.maximum_messages_in_message_group,
        batching_period: FIFO_BATCHING_PERIOD,
        message_visibility_timeout: properties.message_visibility_timeout,
        error_backoff_time: properties.error_backoff_time,
    });
    let broker_properties = Arc::new(StaticGroupingMessageBrokerProperties {
        concurrency: StaticConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level,
            concurrency_polling_rate: properties.concurrency_polling_rate,
            error_backoff_time: properties.error_backoff_time,
        },
        maximum_number_of_cached_message_groups: properties.maximum_cached_message_groups,
        message_grouping_function: None,
        purge_extra_messages_in_group_on_error: true,
        process_cached_messages_on_shutdown: properties.try_and_process_any_extra_retrieved_messages_on_shutdown,
    });
    let retriever_client = Arc::clone(&client);

    MessageListenerContainer::builder(identifier)
        .properties(ContainerProperties {
            interrupt_processing_on_shutdown: properties.interrupt_processing_on_shutdown,
            process_extra_retrieved_messages_on_shutdown: false,
            ..ContainerProperties::default()
        })
        .retriever(move || {
            let retriever: Arc<dyn MessageRetriever> = Arc::new(BatchingMessageRetriever::new(
                Arc::clone(&retriever_client),
                retriever_properties.clone(),
            ));
            Ok(retriever)
        })
        .broker(move || {
            let broker: Arc<dyn MessageBroker> = Arc::new(GroupingMessageBroker::new(broker_properties.clone()));
            Ok(broker)
        })
        .resolver(resolver_factory(
            &client,
            StaticBatchingMessageResolverProperties {
                buffering_size_limit: 1,
                buffering_time: DEFAULT_BUFFERING_TIME,
            },
        ))
        .processor(move || Ok(Arc::clone(&processor)))
        .build()
}

/// Build the preset selected by `listener.kind`.
pub fn container_from_config(
    listener: &ListenerConfig,
    queue: &QueueConfig,
    client: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
) -> Result<MessageListenerContainer, ListenerError> {
    let visibility = (queue.visibility_timeout_secs > 0)
        .then(|| Duration::from_secs(u64::from(queue.visibility_timeout_secs)));
    let error_backoff_time = Duration::from_millis(listener.error_backoff_ms);
    let concurrency_level = listener.concurrency_level as usize;

    match listener.kind {
        ListenerKind::Batching => batching_container(
            &listener.identifier,
            client,
            processor,
            BatchingContainerProperties {
                concurrency_level,
                batch_size: listener.batch_size as usize,
                batching_period: Duration::from_millis(listener.batching_period_ms),
                message_visibility_timeout: visibility,
                error_backoff_time,
                interrupt_processing_on_shutdown: listener.interrupt_on_shutdown,
                process_extra_retrieved_messages_on_shutdown: listener.process_extra_messages_on_shutdown,
                ..Default::default()
            },
        ),
        ListenerKind::Prefetching => prefetching_container(
            &listener.identifier,
            client,
            processor,
            PrefetchingContainerProperties {
                concurrency_level,
                desired_min_prefetched_messages: listener.desired_min_prefetched_messages as usize,
                max_prefetched_messages: listener.max_prefetched_messages as usize,
                message_visibility_timeout: visibility,
                error_backoff_time,
                resolver_buffering_size_limit: listener.resolver_buffering_size as usize,
                resolver_buffering_time: Duration::from_millis(listener.resolver_buffering_time_ms),
                interrupt_processing_on_shutdown: listener.interrupt_on_shutdown,
                process_extra_retrieved_messages_on_shutdown: listener.process_extra_messages_on_shutdown,
                ..Default::default()
            },
        ),
        ListenerKind::Fifo => {
            if !queue.is_fifo() {
                return Err(ListenerError::Configuration(format!(
                    "fifo listener requires a .fifo queue, got {}",
                    queue.queue_url
                )));
            }
            fifo_container(
                &listener.identifier,
                client,
                processor,
                FifoContainerProperties {
                    concurrency_level,
                    maximum_messages_in_message_group: listener.batch_size as usize,
                    maximum_cached_message_groups: listener.maximum_cached_message_groups as usize,
                    message_visibility_timeout: visibility,
                    error_backoff_time,
                    try_and_process_any_extra_retrieved_messages_on_shutdown: listener
                        .process_extra_messages_on_shutdown,
                    interrupt_processing_on_shutdown: listener.interrupt_on_shutdown,
                    ..Default::default()
                },
            )
        }
    }
}
