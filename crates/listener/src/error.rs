//! Error types for the listener runtime.

use thiserror::Error;

/// Failures talking to the queue service.
///
/// `Clone` so that one failed batch call can complete every future in it.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("request build error: {0}")]
    Request(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// A properties provider could not produce a value.
///
/// Always treated as transient: the caller logs it and falls back to a default.
#[derive(Debug, Clone, Error)]
#[error("failed to read property {name}: {reason}")]
pub struct PropertyError {
    pub name: &'static str,
    pub reason: String,
}

impl PropertyError {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed message processing attempt.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    #[error("message processing was interrupted")]
    Interrupted,

    #[error("message processing panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProcessingError::Interrupted)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("request was cancelled")]
    Cancelled,

    #[error("{0} has stopped")]
    Stopped(&'static str),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to resolve message {id}: {reason}")]
    ResolutionFailed { id: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ListenerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ListenerError::Cancelled)
    }
}

impl From<PropertyError> for ListenerError {
    fn from(error: PropertyError) -> Self {
        ListenerError::Configuration(error.to_string())
    }
}

impl From<sqs_listener_core::ConfigError> for ListenerError {
    fn from(error: sqs_listener_core::ConfigError) -> Self {
        ListenerError::Configuration(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_error_display() {
        let err = PropertyError::new("batchSize", "flag service unavailable");
        assert_eq!(
            err.to_string(),
            "failed to read property batchSize: flag service unavailable"
        );
    }

    #[test]
    fn test_queue_error_converts_transparently() {
        let err: ListenerError = QueueError::Connection("timed out".into()).into();
        assert_eq!(err.to_string(), "connection error: timed out");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_processing_error_from_anyhow() {
        let err: ProcessingError = anyhow::anyhow!("bad payload").into();
        assert_eq!(err.to_string(), "bad payload");
        assert!(!err.is_interrupted());
        assert!(ProcessingError::Interrupted.is_interrupted());
    }
}
