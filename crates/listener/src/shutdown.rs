//! Cooperative shutdown signalling.
//!
//! Every background loop in the runtime holds a [`Shutdown`] and selects on
//! it at each suspension point, so a stop request is observed promptly and
//! never swallowed by a sleep. A dropped [`ShutdownTrigger`] counts as
//! triggered.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// A wait was cut short because shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by shutdown")]
pub struct Interrupted;

/// Sending half: fires the shutdown signal for all clones of the paired [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half, cloned into every task that must observe shutdown.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for signals that never fire.
    _never: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx: Arc::new(tx) },
        Shutdown { rx, _never: None },
    )
}

impl Shutdown {
    /// A signal that is never triggered.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _never: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested (or the trigger was dropped).
    pub async fn triggered(&mut self) {
        // An error means the trigger is gone, which is treated as shutdown.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Sleep for `duration`, returning early with [`Interrupted`] on shutdown.
pub async fn backoff(duration: Duration, shutdown: &mut Shutdown) -> Result<(), Interrupted> {
    if shutdown.is_triggered() {
        return Err(Interrupted);
    }
    tokio::select! {
        _ = shutdown.triggered() => Err(Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Per-message cancellation handle for in-progress processing.
///
/// Clones share state: firing any clone interrupts them all.
#[derive(Debug, Clone)]
pub struct Interrupt {
    trigger: ShutdownTrigger,
    signal: Shutdown,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (trigger, signal) = channel();
        Self { trigger, signal }
    }

    pub fn interrupt(&self) {
        self.trigger.trigger();
    }

    pub fn is_interrupted(&self) -> bool {
        self.trigger.is_triggered()
    }

    /// Resolves once [`Interrupt::interrupt`] has been called on any clone.
    pub async fn interrupted(&self) {
        let mut signal = self.signal.clone();
        signal.triggered().await;
    }
}
