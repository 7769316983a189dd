//! Bounded drain over an unbounded request queue.
//!
//! [`BatchDrain`] collects queued items until either the size threshold or
//! the time window is reached, whichever comes first. Both the batching
//! retriever (pending receives) and the resolver (pending deletions) build
//! their batches with it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::shutdown::Shutdown;

/// Result of a single [`BatchDrain::drain`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Drained<T> {
    /// The size threshold or time window was reached.
    Complete(Vec<T>),
    /// Shutdown fired mid-drain; carries what was collected so far.
    Interrupted(Vec<T>),
}

impl<T> Drained<T> {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Drained::Interrupted(_))
    }

    pub fn into_inner(self) -> Vec<T> {
        match self {
            Drained::Complete(items) | Drained::Interrupted(items) => items,
        }
    }
}

/// Single-consumer side of a request queue, with support for pushing
/// unconsumed items back to the head.
pub struct BatchDrain<T> {
    rx: mpsc::UnboundedReceiver<T>,
    pushed_back: VecDeque<T>,
}

impl<T> BatchDrain<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx,
            pushed_back: VecDeque::new(),
        }
    }

    /// Collect up to `max` items, waiting at most `timeout` from the start of
    /// the call.
    ///
    /// Pushed-back items are taken first. Returns early if the sending side
    /// has closed. `max` below 1 is treated as 1.
    pub async fn drain(&mut self, max: usize, timeout: Duration, shutdown: &mut Shutdown) -> Drained<T> {
        let max = max.max(1);
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            match self.pushed_back.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        if shutdown.is_triggered() {
            return Drained::Interrupted(batch);
        }

        while batch.len() < max {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Drained::Interrupted(batch),
                item = self.rx.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        Drained::Complete(batch)
    }

    /// Take everything that is available right now without waiting.
    pub fn drain_now(&mut self) -> Vec<T> {
        let mut items: Vec<T> = self.pushed_back.drain(..).collect();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Stop accepting new items. Items already queued can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Return unconsumed items to the head of the queue, preserving their order.
    pub fn push_front(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.pushed_back.push_front(item);
        }
    }

    /// Number of pushed-back items waiting ahead of the channel.
    pub fn pushed_back_len(&self) -> usize {
        self.pushed_back.len()
    }
}
