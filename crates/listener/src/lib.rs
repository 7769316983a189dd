pub mod batcher;
pub mod broker;
pub mod client;
pub mod container;
pub mod containers;
pub mod error;
pub mod extender;
pub mod message;
pub mod processor;
pub mod properties;
pub mod resolver;
pub mod retriever;
pub mod shutdown;
pub mod sqs;
pub mod worker;

pub use broker::{ConcurrentMessageBroker, GroupingMessageBroker, MessageBroker};
pub use client::{BatchResult, DeleteEntry, QueueClient, ReceiveRequest, VisibilityEntry};
pub use container::{MessageListenerContainer, MessageListenerContainerBuilder};
pub use containers::{
    batching_container, container_from_config, fifo_container, prefetching_container,
    BatchingContainerProperties, FifoContainerProperties, PrefetchingContainerProperties,
};
pub use error::{ListenerError, ProcessingError, PropertyError, QueueError};
pub use extender::AutoVisibilityExtender;
pub use message::Message;
pub use processor::{Acknowledge, DecoratingMessageProcessor, FnMessageProcessor, MessageProcessor};
pub use resolver::{BatchingMessageResolver, MessageResolver};
pub use retriever::{BatchingMessageRetriever, MessageRetriever, PrefetchingMessageRetriever};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use sqs::SqsQueueClient;
pub use worker::WorkerPool;
