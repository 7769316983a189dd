//! Message processors and processing decorators.
//!
//! A [`MessageProcessor`] runs the business logic for one message and
//! decides when the message is resolved through its [`Acknowledge`] handle.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, warn};

use crate::error::{ListenerError, ProcessingError};
use crate::message::Message;
use crate::resolver::{MessageResolver, ResolutionFuture};
use crate::shutdown::Interrupt;

/// Queues the message for resolution when called.
pub type ResolveCallback = Arc<dyn Fn() -> ResolutionFuture + Send + Sync>;

/// Handle for resolving the message being processed.
#[derive(Clone)]
pub struct Acknowledge {
    callback: ResolveCallback,
}

impl Acknowledge {
    pub fn new(callback: ResolveCallback) -> Self {
        Self { callback }
    }

    /// Resolve `message` through `resolver`.
    pub fn for_message(resolver: Arc<dyn MessageResolver>, message: Message) -> Self {
        Self::new(Arc::new(move || resolver.resolve_message(message.clone())))
    }

    /// Queue the message for deletion. The returned future completes when the
    /// queue has confirmed or rejected it; dropping it does not undo the request.
    pub fn acknowledge(&self) -> ResolutionFuture {
        (self.callback)()
    }
}

impl std::fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledge").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: Message, acknowledge: Acknowledge) -> Result<(), ProcessingError>;
}

// ── Closure-backed processor ────────────────────────────────────

type Handler = Box<dyn Fn(Message, Acknowledge) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Processor backed by an async closure.
pub struct FnMessageProcessor {
    handler: Handler,
    auto_resolve: bool,
}

impl FnMessageProcessor {
    /// The message is resolved whenever `handler` returns `Ok`.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |message, _| handler(message).boxed()),
            auto_resolve: true,
        }
    }

    /// `handler` resolves the message itself through the [`Acknowledge`] it is given.
    pub fn with_acknowledge<F, Fut>(handler: F) -> Self
    where
        F: Fn(Message, Acknowledge) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |message, acknowledge| handler(message, acknowledge).boxed()),
            auto_resolve: false,
        }
    }
}

#[async_trait]
impl MessageProcessor for FnMessageProcessor {
    async fn process(&self, message: Message, acknowledge: Acknowledge) -> Result<(), ProcessingError> {
        let message_id = message.id.clone();
        (self.handler)(message, acknowledge.clone()).await?;

        if self.auto_resolve {
            let resolution = acknowledge.acknowledge();
            tokio::spawn(async move {
                if let Err(e) = resolution.await {
                    warn!(message_id = %message_id, error = %e, "Failed to resolve message");
                }
            });
        }
        Ok(())
    }
}

// ── Decorators ──────────────────────────────────────────────────

/// Per-message state shared with every decorator hook.
#[derive(Debug, Clone)]
pub struct MessageProcessingContext {
    pub listener_identifier: String,
    /// Fires to abandon processing of this message.
    pub interrupt: Interrupt,
}

/// Hooks around message processing and resolution.
///
/// A failing [`on_pre_processing`](Self::on_pre_processing) fails the
/// message. Failures from any other hook are logged and ignored.
pub trait MessageProcessingDecorator: Send + Sync {
    fn name(&self) -> &str {
        "message-processing-decorator"
    }

    fn on_pre_processing(&self, _context: &MessageProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_processing_success(&self, _context: &MessageProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_processing_failure(
        &self,
        _context: &MessageProcessingContext,
        _message: &Message,
        _error: &ProcessingError,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once processing has ended for any reason, including abort.
    fn on_processing_complete(&self, _context: &MessageProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_resolve(&self, _context: &MessageProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_resolve_success(&self, _context: &MessageProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_resolve_failure(
        &self,
        _context: &MessageProcessingContext,
        _message: &Message,
        _error: &ListenerError,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

type Decorators = Arc<Vec<Arc<dyn MessageProcessingDecorator>>>;

fn run_hooks<F>(decorators: &Decorators, hook: F)
where
    F: Fn(&dyn MessageProcessingDecorator) -> anyhow::Result<()>,
{
    for decorator in decorators.iter() {
        if let Err(e) = hook(decorator.as_ref()) {
            error!(decorator = decorator.name(), error = %e, "Error running message processing decorator");
        }
    }
}

/// Runs the completion hooks when processing ends, even if the task is aborted.
struct CompletionHooks {
    decorators: Decorators,
    context: MessageProcessingContext,
    message: Message,
}

impl Drop for CompletionHooks {
    fn drop(&mut self) {
        run_hooks(&self.decorators, |d| d.on_processing_complete(&self.context, &self.message));
    }
}

/// Wraps a processor with [`MessageProcessingDecorator`] hooks.
pub struct DecoratingMessageProcessor {
    listener_identifier: String,
    decorators: Decorators,
    delegate: Arc<dyn MessageProcessor>,
}

impl DecoratingMessageProcessor {
    pub fn new(
        listener_identifier: impl Into<String>,
        decorators: Vec<Arc<dyn MessageProcessingDecorator>>,
        delegate: Arc<dyn MessageProcessor>,
    ) -> Self {
        Self {
            listener_identifier: listener_identifier.into(),
            decorators: Arc::new(decorators),
            delegate,
        }
    }

    fn wrap_acknowledge(
        &self,
        context: &MessageProcessingContext,
        message: &Message,
        acknowledge: Acknowledge,
    ) -> Acknowledge {
        let decorators = Arc::clone(&self.decorators);
        let context = context.clone();
        let message = message.clone();

        Acknowledge::new(Arc::new(move || {
            run_hooks(&decorators, |d| d.on_resolve(&context, &message));
            let resolution = acknowledge.acknowledge();

            let decorators = Arc::clone(&decorators);
            let context = context.clone();
            let message = message.clone();
            async move {
                let result = resolution.await;
                match &result {
                    Ok(()) => run_hooks(&decorators, |d| d.on_resolve_success(&context, &message)),
                    Err(e) => run_hooks(&decorators, |d| d.on_resolve_failure(&context, &message, e)),
                }
                result
            }
            .boxed()
        }))
    }
}

#[async_trait]
impl MessageProcessor for DecoratingMessageProcessor {
    async fn process(&self, message: Message, acknowledge: Acknowledge) -> Result<(), ProcessingError> {
        let context = MessageProcessingContext {
            listener_identifier: self.listener_identifier.clone(),
            interrupt: Interrupt::new(),
        };

        let _complete = CompletionHooks {
            decorators: Arc::clone(&self.decorators),
            context: context.clone(),
            message: message.clone(),
        };

        for decorator in self.decorators.iter() {
            decorator
                .on_pre_processing(&context, &message)
                .map_err(ProcessingError::Handler)?;
        }

        let acknowledge = self.wrap_acknowledge(&context, &message, acknowledge);

        let result = tokio::select! {
            result = self.delegate.process(message.clone(), acknowledge) => result,
            _ = context.interrupt.interrupted() => Err(ProcessingError::Interrupted),
        };

        match &result {
            Ok(()) => run_hooks(&self.decorators, |d| d.on_processing_success(&context, &message)),
            Err(e) => run_hooks(&self.decorators, |d| d.on_processing_failure(&context, &message, e)),
        }

        result
    }
}
