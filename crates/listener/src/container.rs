//! Listener container: owns one retriever, broker, resolver and processor,
//! runs each loop on its own task, and coordinates their shutdown.
//!
//! Shutdown order:
//! 1. the broker stops dispatching,
//! 2. the retriever stops and hands back what it never delivered,
//! 3. optionally those messages are pushed through the broker once more,
//! 4. the worker pool drains (or is interrupted),
//! 5. the resolver flushes its outstanding deletions.
//!
//! Every step is bounded by its own timeout from [`ContainerProperties`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{KeepRunning, MessageBroker, MessageConsumer, MessageSupplier};
use crate::error::ListenerError;
use crate::message::Message;
use crate::processor::{Acknowledge, MessageProcessor};
use crate::properties::ContainerProperties;
use crate::resolver::MessageResolver;
use crate::retriever::MessageRetriever;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::worker::WorkerPool;

pub type RetrieverFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageRetriever>, ListenerError> + Send + Sync>;
pub type BrokerFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageBroker>, ListenerError> + Send + Sync>;
pub type ResolverFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageResolver>, ListenerError> + Send + Sync>;
pub type ProcessorFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageProcessor>, ListenerError> + Send + Sync>;

struct Factories {
    retriever: RetrieverFactory,
    broker: BrokerFactory,
    resolver: ResolverFactory,
    processor: ProcessorFactory,
}

/// Fresh component instances for one run of the container.
struct Components {
    retriever: Arc<dyn MessageRetriever>,
    broker: Arc<dyn MessageBroker>,
    resolver: Arc<dyn MessageResolver>,
    processor: Arc<dyn MessageProcessor>,
}

impl Factories {
    fn create(&self) -> Result<Components, ListenerError> {
        Ok(Components {
            retriever: (self.retriever)()?,
            broker: (self.broker)()?,
            resolver: (self.resolver)()?,
            processor: (self.processor)()?,
        })
    }
}

struct Running {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

pub struct MessageListenerContainer {
    identifier: String,
    properties: ContainerProperties,
    factories: Factories,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for MessageListenerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageListenerContainer")
            .field("identifier", &self.identifier)
            .field("properties", &self.properties)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ── Builder ─────────────────────────────────────────────────────

/// Builder for [`MessageListenerContainer`]. All four component factories
/// are required.
pub struct MessageListenerContainerBuilder {
    identifier: String,
    properties: ContainerProperties,
    retriever: Option<RetrieverFactory>,
    broker: Option<BrokerFactory>,
    resolver: Option<ResolverFactory>,
    processor: Option<ProcessorFactory>,
}

impl MessageListenerContainerBuilder {
    pub fn properties(mut self, properties: ContainerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn retriever<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn MessageRetriever>, ListenerError> + Send + Sync + 'static,
    {
        self.retriever = Some(Arc::new(factory));
        self
    }

    pub fn broker<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn MessageBroker>, ListenerError> + Send + Sync + 'static,
    {
        self.broker = Some(Arc::new(factory));
        self
    }

    pub fn resolver<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn MessageResolver>, ListenerError> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(factory));
        self
    }

    pub fn processor<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn MessageProcessor>, ListenerError> + Send + Sync + 'static,
    {
        self.processor = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<MessageListenerContainer, ListenerError> {
        if self.identifier.trim().is_empty() {
            return Err(ListenerError::Configuration("container identifier must not be blank".into()));
        }
        let missing = |component: &str| {
            ListenerError::Configuration(format!(
                "container {} has no {component} factory",
                self.identifier
            ))
        };

        let factories = Factories {
            retriever: self.retriever.clone().ok_or_else(|| missing("message retriever"))?,
            broker: self.broker.clone().ok_or_else(|| missing("message broker"))?,
            resolver: self.resolver.clone().ok_or_else(|| missing("message resolver"))?,
            processor: self.processor.clone().ok_or_else(|| missing("message processor"))?,
        };

        Ok(MessageListenerContainer {
            identifier: self.identifier,
            properties: self.properties,
            factories,
            running: Mutex::new(None),
        })
    }
}

// ── Container ───────────────────────────────────────────────────

impl MessageListenerContainer {
    pub fn builder(identifier: impl Into<String>) -> MessageListenerContainerBuilder {
        MessageListenerContainerBuilder {
            identifier: identifier.into(),
            properties: ContainerProperties::default(),
            retriever: None,
            broker: None,
            resolver: None,
            processor: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Create fresh components and start processing. Does nothing if the
    /// container is already running. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), ListenerError> {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(listener = %self.identifier, "Container already running");
            return Ok(());
        }

        let components = self.factories.create()?;
        let (trigger, shutdown) = shutdown::channel();
        let handle = tokio::spawn(run_container(
            self.identifier.clone(),
            self.properties.clone(),
            components,
            shutdown,
        ));

        *running = Some(Running { trigger, handle });
        info!(listener = %self.identifier, "Container started");
        Ok(())
    }

    /// Signal shutdown and wait for every component to stop.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        info!(listener = %self.identifier, "Stopping container");
        running.trigger.trigger();
        if let Err(e) = running.handle.await {
            error!(listener = %self.identifier, error = %e, "Container task failed");
        }
        info!(listener = %self.identifier, "Container stopped");
    }

    /// Like [`stop`](Self::stop) but gives up after `timeout`, abandoning
    /// whatever is still shutting down. Returns `true` if shutdown completed.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> bool {
        let Some(running) = self.running().take() else {
            return true;
        };
        info!(listener = %self.identifier, "Stopping container");
        running.trigger.trigger();

        let mut handle = running.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(listener = %self.identifier, "Container stopped");
                true
            }
            Ok(Err(e)) => {
                error!(listener = %self.identifier, error = %e, "Container task failed");
                true
            }
            Err(_) => {
                warn!(
                    listener = %self.identifier,
                    timeout_ms = timeout.as_millis() as u64,
                    "Container did not stop before timeout"
                );
                handle.abort();
                false
            }
        }
    }
}

// ── Run loop ────────────────────────────────────────────────────

fn message_consumer(processor: Arc<dyn MessageProcessor>, resolver: Arc<dyn MessageResolver>) -> MessageConsumer {
    Arc::new(move |message: Message| {
        let processor = Arc::clone(&processor);
        let acknowledge = Acknowledge::for_message(Arc::clone(&resolver), message.clone());
        async move { processor.process(message, acknowledge).await }.boxed()
    })
}

/// Wait for a component task up to `timeout`, aborting it if it overruns.
async fn join_within<T>(
    listener: &str,
    component: &'static str,
    task: &mut JoinHandle<Result<T, ListenerError>>,
    timeout: Duration,
) -> Option<T> {
    match tokio::time::timeout(timeout, &mut *task).await {
        Ok(Ok(Ok(value))) => Some(value),
        Ok(Ok(Err(e))) => {
            error!(listener, component, error = %e, "Component stopped with error");
            None
        }
        Ok(Err(e)) => {
            error!(listener, component, error = %e, "Component task failed");
            None
        }
        Err(_) => {
            warn!(
                listener,
                component,
                timeout_ms = timeout.as_millis() as u64,
                "Component did not stop before timeout, aborting"
            );
            task.abort();
            None
        }
    }
}

async fn run_container(
    identifier: String,
    properties: ContainerProperties,
    components: Components,
    mut shutdown: Shutdown,
) {
    let listener = identifier.as_str();
    let Components {
        retriever,
        broker,
        resolver,
        processor,
    } = components;

    let (resolver_trigger, resolver_shutdown) = shutdown::channel();
    let mut resolver_task = {
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move { resolver.run(resolver_shutdown).await })
    };

    let (retriever_trigger, retriever_shutdown) = shutdown::channel();
    let mut retriever_task = {
        let retriever = Arc::clone(&retriever);
        tokio::spawn(async move { retriever.run(retriever_shutdown).await })
    };

    let pool = WorkerPool::new(format!("{identifier}-message-processing"));
    let consumer = message_consumer(processor, Arc::clone(&resolver));

    let mut broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = Arc::clone(&consumer);
        let supplier: MessageSupplier = {
            let retriever = Arc::clone(&retriever);
            Arc::new(move || Ok(retriever.retrieve_message()))
        };
        let keep_running: KeepRunning = Arc::new(|| true);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            broker
                .process_messages(&pool, keep_running, supplier, consumer, shutdown)
                .await
        })
    };
    info!(listener, "Message listener container running");

    // ── Broker ──
    tokio::select! {
        result = &mut broker_task => match result {
            Ok(Ok(())) => warn!(listener, "Message broker stopped before shutdown was requested"),
            Ok(Err(e)) => error!(listener, error = %e, "Message broker failed"),
            Err(e) => error!(listener, error = %e, "Message broker task failed"),
        },
        _ = shutdown.triggered() => {
            info!(listener, "Shutdown requested, stopping message broker");
            join_within(listener, "message-broker", &mut broker_task, properties.message_broker_shutdown_timeout).await;
        }
    }

    // ── Retriever ──
    retriever_trigger.trigger();
    let extra = join_within(
        listener,
        "message-retriever",
        &mut retriever_task,
        properties.message_retriever_shutdown_timeout,
    )
    .await
    .unwrap_or_default();

    if !extra.is_empty() {
        if properties.process_extra_retrieved_messages_on_shutdown {
            process_extra_messages(listener, &properties, broker.as_ref(), &pool, consumer, extra).await;
        } else {
            info!(
                listener,
                count = extra.len(),
                "Leaving extra retrieved messages to reappear after their visibility timeout"
            );
        }
    }

    // ── Processing ──
    let drained = pool
        .shutdown(
            properties.interrupt_processing_on_shutdown,
            properties.message_processing_shutdown_timeout,
        )
        .await;
    if !drained {
        pool.abort_all();
    }

    // ── Resolver ──
    resolver_trigger.trigger();
    join_within(
        listener,
        "message-resolver",
        &mut resolver_task,
        properties.message_resolver_shutdown_timeout,
    )
    .await;

    info!(listener, "Message listener container shut down");
}

/// Push messages the retriever never handed out through the broker one
/// last time.
async fn process_extra_messages(
    listener: &str,
    properties: &ContainerProperties,
    broker: &dyn MessageBroker,
    pool: &WorkerPool,
    consumer: MessageConsumer,
    messages: Vec<Message>,
) {
    info!(listener, count = messages.len(), "Processing extra retrieved messages");

    let remaining = Arc::new(Mutex::new(VecDeque::from(messages)));
    let keep_running: KeepRunning = {
        let remaining = Arc::clone(&remaining);
        Arc::new(move || !remaining.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
    };
    let supplier: MessageSupplier = Arc::new(move || {
        remaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .map(|message| futures::future::ready(Ok(message)).boxed())
            .ok_or_else(|| ListenerError::Internal("no extra messages left".into()))
    });

    let processing = broker.process_messages(pool, keep_running, supplier, consumer, Shutdown::never());
    match tokio::time::timeout(properties.message_broker_shutdown_timeout, processing).await {
        Ok(Ok(())) => debug!(listener, "Extra retrieved messages dispatched"),
        Ok(Err(e)) => error!(listener, error = %e, "Error processing extra retrieved messages"),
        Err(_) => warn!(listener, "Timed out dispatching extra retrieved messages"),
    }
}
