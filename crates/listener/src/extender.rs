//! Decorator that keeps extending the visibility timeout of messages while
//! they are being processed.
//!
//! One timer task per extender tracks every message in flight. Shortly
//! before a message's visibility timeout would lapse, the timer sends a
//! batched change-visibility call for it. A message still processing after
//! `max_duration` is interrupted and no longer tracked. The timer starts with
//! the first registered message and exits once nothing is tracked.
//!
//! Extension calls are fire-and-forget: a failed call is logged and the
//! message may become visible again before it finishes processing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::client::{QueueClient, VisibilityEntry, MAX_NUMBER_OF_MESSAGES_IN_BATCH};
use crate::error::ListenerError;
use crate::message::Message;
use crate::processor::{MessageProcessingContext, MessageProcessingDecorator};
use crate::properties::AutoVisibilityExtenderProperties;
use crate::shutdown::Interrupt;

struct TrackedMessage {
    message: Message,
    interrupt: Interrupt,
    started: Instant,
    next_extension: Instant,
}

#[derive(Default)]
struct ExtenderState {
    tracked: HashMap<String, TrackedMessage>,
    timer_running: bool,
}

struct ExtenderInner {
    client: Arc<dyn QueueClient>,
    properties: Arc<dyn AutoVisibilityExtenderProperties>,
    state: Mutex<ExtenderState>,
    changed: Notify,
}

impl ExtenderInner {
    fn lock(&self) -> MutexGuard<'_, ExtenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_extension(&self, from: Instant, message: &Message) -> Instant {
        let visibility = self.properties.visibility_timeout_for(message);
        from + visibility.saturating_sub(self.properties.buffer_duration())
    }

    fn untrack(&self, message: &Message) {
        let mut state = self.lock();
        if let Some(tracked) = state.tracked.remove(&message.id) {
            self.properties.message_done_processing(&tracked.message);
            self.changed.notify_one();
        }
    }

    /// One timer pass. Returns when the timer next needs to wake, or `None`
    /// once nothing is tracked (the timer is then marked stopped).
    fn tick(self: &Arc<Self>, listener: &str) -> Option<Instant> {
        let mut state = self.lock();
        if state.tracked.is_empty() {
            state.timer_running = false;
            return None;
        }

        let now = Instant::now();
        let max_duration = self.properties.max_duration();

        let expired: Vec<String> = state
            .tracked
            .iter()
            .filter(|(_, tracked)| now >= tracked.started + max_duration)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(tracked) = state.tracked.remove(&id) {
                info!(
                    listener,
                    message_id = %id,
                    "Interrupting message processing, maximum duration exceeded"
                );
                tracked.interrupt.interrupt();
                self.properties.message_done_processing(&tracked.message);
            }
        }

        let mut due = Vec::new();
        for tracked in state.tracked.values_mut() {
            if now >= tracked.next_extension {
                info!(listener, message_id = %tracked.message.id, "Extending visibility timeout");
                due.push(VisibilityEntry {
                    id: tracked.message.id.clone(),
                    receipt_handle: tracked.message.receipt_handle.clone(),
                    visibility_timeout: self.properties.visibility_timeout_for(&tracked.message),
                });
                tracked.next_extension = self.next_extension(now, &tracked.message);
            }
        }
        for batch in due.chunks(MAX_NUMBER_OF_MESSAGES_IN_BATCH) {
            self.extend(batch.to_vec());
        }

        state
            .tracked
            .values()
            .map(|tracked| (tracked.started + max_duration).min(tracked.next_extension))
            .min()
            .or(Some(now))
    }

    fn extend(&self, entries: Vec<VisibilityEntry>) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
            match client.change_visibility_batch(entries).await {
                Ok(result) if result.has_failures() => {
                    let failed: Vec<&str> = result.failed.iter().map(|f| f.id.as_str()).collect();
                    error!(?failed, "Some messages failed to have their visibility timeout changed");
                }
                Ok(_) => debug!(?ids, "Extended visibility timeout"),
                Err(e) => error!(?ids, error = %e, "Error changing visibility timeout"),
            }
        });
    }

    async fn run_timer(self: Arc<Self>, listener: String) {
        debug!(listener = %listener, "Starting auto visibility extender");
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let Some(wake_at) = self.tick(&listener) else {
                break;
            };
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
        debug!(listener = %listener, "Auto visibility extender stopped");
    }
}

/// [`MessageProcessingDecorator`] that extends visibility while messages process.
#[derive(Clone)]
pub struct AutoVisibilityExtender {
    inner: Arc<ExtenderInner>,
}

impl AutoVisibilityExtender {
    /// Fails when `max_duration` is zero or `buffer_duration` is not shorter
    /// than the visibility timeout.
    pub fn new(
        client: Arc<dyn QueueClient>,
        properties: Arc<dyn AutoVisibilityExtenderProperties>,
    ) -> Result<Self, ListenerError> {
        if properties.max_duration() == Duration::ZERO {
            return Err(ListenerError::Configuration(
                "auto visibility extender max_duration must be positive".into(),
            ));
        }
        if properties.buffer_duration() >= properties.visibility_timeout() {
            return Err(ListenerError::Configuration(format!(
                "auto visibility extender buffer ({:?}) must be shorter than the visibility timeout ({:?})",
                properties.buffer_duration(),
                properties.visibility_timeout()
            )));
        }

        Ok(Self {
            inner: Arc::new(ExtenderInner {
                client,
                properties,
                state: Mutex::new(ExtenderState::default()),
                changed: Notify::new(),
            }),
        })
    }

    /// Number of messages currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().tracked.len()
    }
}

impl MessageProcessingDecorator for AutoVisibilityExtender {
    fn name(&self) -> &str {
        "auto-visibility-extender"
    }

    fn on_pre_processing(&self, context: &MessageProcessingContext, message: &Message) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        debug!(message_id = %message.id, "Registering message with visibility extender");
        state.tracked.insert(
            message.id.clone(),
            TrackedMessage {
                message: message.clone(),
                interrupt: context.interrupt.clone(),
                started: now,
                next_extension: self.inner.next_extension(now, message),
            },
        );

        if !state.timer_running {
            state.timer_running = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.run_timer(format!("{}-auto-visibility-extender", context.listener_identifier)));
        }
        self.inner.changed.notify_one();
        Ok(())
    }

    fn on_processing_complete(&self, _context: &MessageProcessingContext, message: &Message) -> anyhow::Result<()> {
        self.inner.untrack(message);
        Ok(())
    }

    fn on_resolve(&self, _context: &MessageProcessingContext, message: &Message) -> anyhow::Result<()> {
        // Acknowledging processors resolve before processing completes.
        self.inner.untrack(message);
        Ok(())
    }
}
