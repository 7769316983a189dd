//! Dynamically-read configuration for the runtime components.
//!
//! Every getter is called on each loop iteration so values can change while
//! the listener is running. A getter may fail; callers log the failure and
//! fall back to a default rather than stopping.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::PropertyError;
use crate::message::Message;

pub const DEFAULT_ERROR_BACKOFF_TIME: Duration = Duration::from_secs(10);
pub const DEFAULT_BATCHING_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_CONCURRENCY_POLLING_RATE: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFERING_TIME: Duration = Duration::from_secs(1);
pub const DEFAULT_VISIBILITY_BUFFER: Duration = Duration::from_secs(2);

/// Read a property, logging and substituting `default` when it fails.
pub(crate) fn safely_get<T>(component: &str, result: Result<T, PropertyError>, default: T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(component, property = e.name, error = %e, "Property read failed, using default");
            default
        }
    }
}

// ── Batching retriever ──────────────────────────────────────────

pub trait BatchingMessageRetrieverProperties: Send + Sync {
    /// Number of pending requests that triggers a receive call.
    fn batch_size(&self) -> Result<usize, PropertyError>;

    /// Longest time a request waits for the batch to fill.
    fn batching_period(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_BATCHING_PERIOD)
    }

    /// Visibility timeout override for received messages.
    fn message_visibility_timeout(&self) -> Result<Option<Duration>, PropertyError> {
        Ok(None)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_ERROR_BACKOFF_TIME)
    }
}

#[derive(Debug, Clone)]
pub struct StaticBatchingMessageRetrieverProperties {
    pub batch_size: usize,
    pub batching_period: Duration,
    pub message_visibility_timeout: Option<Duration>,
    pub error_backoff_time: Duration,
}

impl Default for StaticBatchingMessageRetrieverProperties {
    fn default() -> Self {
        Self {
            batch_size: 1,
            batching_period: DEFAULT_BATCHING_PERIOD,
            message_visibility_timeout: None,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
        }
    }
}

impl BatchingMessageRetrieverProperties for StaticBatchingMessageRetrieverProperties {
    fn batch_size(&self) -> Result<usize, PropertyError> {
        Ok(self.batch_size)
    }

    fn batching_period(&self) -> Result<Duration, PropertyError> {
        Ok(self.batching_period)
    }

    fn message_visibility_timeout(&self) -> Result<Option<Duration>, PropertyError> {
        Ok(self.message_visibility_timeout)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(self.error_backoff_time)
    }
}

// ── Prefetching retriever ───────────────────────────────────────

/// Prefetch bounds are read once, at construction.
pub trait PrefetchingMessageRetrieverProperties: Send + Sync {
    fn desired_min_prefetched_messages(&self) -> Result<usize, PropertyError>;

    fn max_prefetched_messages(&self) -> Result<usize, PropertyError>;

    fn message_visibility_timeout(&self) -> Result<Option<Duration>, PropertyError> {
        Ok(None)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_ERROR_BACKOFF_TIME)
    }
}

#[derive(Debug, Clone)]
pub struct StaticPrefetchingMessageRetrieverProperties {
    pub desired_min_prefetched_messages: usize,
    pub max_prefetched_messages: usize,
    pub message_visibility_timeout: Option<Duration>,
    pub error_backoff_time: Duration,
}

impl Default for StaticPrefetchingMessageRetrieverProperties {
    fn default() -> Self {
        Self {
            desired_min_prefetched_messages: 1,
            max_prefetched_messages: 10,
            message_visibility_timeout: None,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
        }
    }
}

impl PrefetchingMessageRetrieverProperties for StaticPrefetchingMessageRetrieverProperties {
    fn desired_min_prefetched_messages(&self) -> Result<usize, PropertyError> {
        Ok(self.desired_min_prefetched_messages)
    }

    fn max_prefetched_messages(&self) -> Result<usize, PropertyError> {
        Ok(self.max_prefetched_messages)
    }

    fn message_visibility_timeout(&self) -> Result<Option<Duration>, PropertyError> {
        Ok(self.message_visibility_timeout)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(self.error_backoff_time)
    }
}

// ── Concurrent broker ───────────────────────────────────────────

pub trait ConcurrentMessageBrokerProperties: Send + Sync {
    /// Maximum number of messages requested or processing at once. Zero pauses the broker.
    fn concurrency_level(&self) -> Result<usize, PropertyError>;

    /// Upper bound on how long the broker waits before re-reading the concurrency level.
    fn concurrency_polling_rate(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_CONCURRENCY_POLLING_RATE)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_ERROR_BACKOFF_TIME)
    }
}

#[derive(Debug, Clone)]
pub struct StaticConcurrentMessageBrokerProperties {
    pub concurrency_level: usize,
    pub concurrency_polling_rate: Duration,
    pub error_backoff_time: Duration,
}

impl Default for StaticConcurrentMessageBrokerProperties {
    fn default() -> Self {
        Self {
            concurrency_level: 1,
            concurrency_polling_rate: DEFAULT_CONCURRENCY_POLLING_RATE,
            error_backoff_time: DEFAULT_ERROR_BACKOFF_TIME,
        }
    }
}

impl ConcurrentMessageBrokerProperties for StaticConcurrentMessageBrokerProperties {
    fn concurrency_level(&self) -> Result<usize, PropertyError> {
        Ok(self.concurrency_level)
    }

    fn concurrency_polling_rate(&self) -> Result<Duration, PropertyError> {
        Ok(self.concurrency_polling_rate)
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        Ok(self.error_backoff_time)
    }
}

// ── Grouping broker ─────────────────────────────────────────────

/// Grouping broker configuration, layered on the concurrent broker's.
pub trait GroupingMessageBrokerProperties: ConcurrentMessageBrokerProperties {
    /// Most groups that may have messages cached at once.
    fn maximum_number_of_cached_message_groups(&self) -> Result<usize, PropertyError>;

    /// Group key for a message. Defaults to the FIFO group id, falling back to
    /// the message id so ungrouped messages never serialise on each other.
    fn message_group(&self, message: &Message) -> String {
        message
            .group_id()
            .map(str::to_string)
            .unwrap_or_else(|| message.id.clone())
    }

    /// Drop the rest of a group's cached messages when one of them fails.
    fn purge_extra_messages_in_group_on_error(&self) -> bool {
        true
    }

    /// Process cached messages before the broker returns on shutdown.
    fn process_cached_messages_on_shutdown(&self) -> bool {
        false
    }
}

pub type MessageGroupingFunction = Arc<dyn Fn(&Message) -> String + Send + Sync>;

#[derive(Clone)]
pub struct StaticGroupingMessageBrokerProperties {
    pub concurrency: StaticConcurrentMessageBrokerProperties,
    pub maximum_number_of_cached_message_groups: usize,
    pub message_grouping_function: Option<MessageGroupingFunction>,
    pub purge_extra_messages_in_group_on_error: bool,
    pub process_cached_messages_on_shutdown: bool,
}

impl fmt::Debug for StaticGroupingMessageBrokerProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticGroupingMessageBrokerProperties")
            .field("concurrency", &self.concurrency)
            .field(
                "maximum_number_of_cached_message_groups",
                &self.maximum_number_of_cached_message_groups,
            )
            .field("custom_grouping", &self.message_grouping_function.is_some())
            .field(
                "purge_extra_messages_in_group_on_error",
                &self.purge_extra_messages_in_group_on_error,
            )
            .field(
                "process_cached_messages_on_shutdown",
                &self.process_cached_messages_on_shutdown,
            )
            .finish()
    }
}

impl Default for StaticGroupingMessageBrokerProperties {
    fn default() -> Self {
        Self {
            concurrency: StaticConcurrentMessageBrokerProperties::default(),
            maximum_number_of_cached_message_groups: 10,
            message_grouping_function: None,
            purge_extra_messages_in_group_on_error: true,
            process_cached_messages_on_shutdown: false,
        }
    }
}

impl ConcurrentMessageBrokerProperties for StaticGroupingMessageBrokerProperties {
    fn concurrency_level(&self) -> Result<usize, PropertyError> {
        self.concurrency.concurrency_level()
    }

    fn concurrency_polling_rate(&self) -> Result<Duration, PropertyError> {
        self.concurrency.concurrency_polling_rate()
    }

    fn error_backoff_time(&self) -> Result<Duration, PropertyError> {
        self.concurrency.error_backoff_time()
    }
}

impl GroupingMessageBrokerProperties for StaticGroupingMessageBrokerProperties {
    fn maximum_number_of_cached_message_groups(&self) -> Result<usize, PropertyError> {
        Ok(self.maximum_number_of_cached_message_groups)
    }

    fn message_group(&self, message: &Message) -> String {
        match &self.message_grouping_function {
            Some(group) => group(message),
            None => message
                .group_id()
                .map(str::to_string)
                .unwrap_or_else(|| message.id.clone()),
        }
    }

    fn purge_extra_messages_in_group_on_error(&self) -> bool {
        self.purge_extra_messages_in_group_on_error
    }

    fn process_cached_messages_on_shutdown(&self) -> bool {
        self.process_cached_messages_on_shutdown
    }
}

// ── Batching resolver ───────────────────────────────────────────

pub trait BatchingMessageResolverProperties: Send + Sync {
    /// Entries per delete call, clamped to `1..=10`.
    fn buffering_size_limit(&self) -> Result<usize, PropertyError>;

    /// Longest time an entry waits for the batch to fill.
    fn buffering_time(&self) -> Result<Duration, PropertyError> {
        Ok(DEFAULT_BUFFERING_TIME)
    }
}

#[derive(Debug, Clone)]
pub struct StaticBatchingMessageResolverProperties {
    pub buffering_size_limit: usize,
    pub buffering_time: Duration,
}

impl Default for StaticBatchingMessageResolverProperties {
    fn default() -> Self {
        Self {
            buffering_size_limit: 10,
            buffering_time: DEFAULT_BUFFERING_TIME,
        }
    }
}

impl BatchingMessageResolverProperties for StaticBatchingMessageResolverProperties {
    fn buffering_size_limit(&self) -> Result<usize, PropertyError> {
        Ok(self.buffering_size_limit)
    }

    fn buffering_time(&self) -> Result<Duration, PropertyError> {
        Ok(self.buffering_time)
    }
}

// ── Auto visibility extender ────────────────────────────────────

pub trait AutoVisibilityExtenderProperties: Send + Sync {
    /// Visibility timeout applied on every extension.
    fn visibility_timeout(&self) -> Duration;

    /// Per-message override of [`visibility_timeout`](Self::visibility_timeout).
    fn visibility_timeout_for(&self, _message: &Message) -> Duration {
        self.visibility_timeout()
    }

    /// Longest a message may process before it is interrupted.
    fn max_duration(&self) -> Duration;

    /// How long before the current timeout lapses the extension is sent.
    fn buffer_duration(&self) -> Duration {
        DEFAULT_VISIBILITY_BUFFER
    }

    /// Called once per message when it stops being tracked.
    fn message_done_processing(&self, _message: &Message) {}
}

#[derive(Debug, Clone)]
pub struct StaticAutoVisibilityExtenderProperties {
    pub visibility_timeout: Duration,
    pub max_duration: Duration,
    pub buffer_duration: Duration,
}

impl AutoVisibilityExtenderProperties for StaticAutoVisibilityExtenderProperties {
    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    fn buffer_duration(&self) -> Duration {
        self.buffer_duration
    }
}

// ── Container ───────────────────────────────────────────────────

/// Lifecycle settings for a [`MessageListenerContainer`](crate::container::MessageListenerContainer).
#[derive(Debug, Clone)]
pub struct ContainerProperties {
    /// Abort in-flight processing instead of waiting for it on shutdown.
    pub interrupt_processing_on_shutdown: bool,
    /// Process messages the retriever still holds once the broker has stopped.
    pub process_extra_retrieved_messages_on_shutdown: bool,
    pub message_retriever_shutdown_timeout: Duration,
    pub message_processing_shutdown_timeout: Duration,
    pub message_resolver_shutdown_timeout: Duration,
    pub message_broker_shutdown_timeout: Duration,
}

impl Default for ContainerProperties {
    fn default() -> Self {
        let timeout = Duration::from_secs(60);
        Self {
            interrupt_processing_on_shutdown: false,
            process_extra_retrieved_messages_on_shutdown: true,
            message_retriever_shutdown_timeout: timeout,
            message_processing_shutdown_timeout: timeout,
            message_resolver_shutdown_timeout: timeout,
            message_broker_shutdown_timeout: timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_GROUP_ID;

    struct FailingProperties;

    impl ConcurrentMessageBrokerProperties for FailingProperties {
        fn concurrency_level(&self) -> Result<usize, PropertyError> {
            Err(PropertyError::new("concurrencyLevel", "unavailable"))
        }
    }

    #[test]
    fn test_safely_get_falls_back_to_default() {
        let props = FailingProperties;
        assert_eq!(safely_get("test", props.concurrency_level(), 0), 0);
        assert_eq!(
            safely_get("test", props.error_backoff_time(), Duration::ZERO),
            DEFAULT_ERROR_BACKOFF_TIME
        );
    }

    #[test]
    fn test_default_grouping_uses_group_id() {
        let props = StaticGroupingMessageBrokerProperties::default();
        let grouped = Message::new("m-1", "r", "").with_attribute(MESSAGE_GROUP_ID, "orders");
        let ungrouped = Message::new("m-2", "r", "");

        assert_eq!(props.message_group(&grouped), "orders");
        assert_eq!(props.message_group(&ungrouped), "m-2");
        assert!(props.purge_extra_messages_in_group_on_error());
        assert!(!props.process_cached_messages_on_shutdown());
    }

    #[test]
    fn test_custom_grouping_function() {
        let props = StaticGroupingMessageBrokerProperties {
            message_grouping_function: Some(Arc::new(|m: &Message| m.body.clone())),
            ..Default::default()
        };
        let msg = Message::new("m-1", "r", "tenant-7");
        assert_eq!(props.message_group(&msg), "tenant-7");
    }

    #[test]
    fn test_container_defaults() {
        let props = ContainerProperties::default();
        assert!(!props.interrupt_processing_on_shutdown);
        assert!(props.process_extra_retrieved_messages_on_shutdown);
        assert_eq!(props.message_broker_shutdown_timeout, Duration::from_secs(60));
    }
}
