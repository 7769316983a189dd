//! Integration tests for the auto visibility extender wrapped around a processor.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::time::timeout;

use sqs_listener::processor::MessageProcessingDecorator;
use sqs_listener::properties::AutoVisibilityExtenderProperties;
use sqs_listener::{
    Acknowledge, AutoVisibilityExtender, DecoratingMessageProcessor, FnMessageProcessor, ListenerError, Message,
    MessageProcessor, ProcessingError,
};

use common::{message, FakeQueue, TIMEOUT};

/// Short timeouts so extensions happen within a test run.
struct TestProperties {
    max_duration: Duration,
    done: AtomicUsize,
}

impl AutoVisibilityExtenderProperties for TestProperties {
    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    fn buffer_duration(&self) -> Duration {
        Duration::from_millis(700)
    }

    fn message_done_processing(&self, _message: &Message) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

fn decorated(
    queue: &Arc<FakeQueue>,
    properties: &Arc<TestProperties>,
    work: Duration,
) -> (AutoVisibilityExtender, DecoratingMessageProcessor) {
    let extender = AutoVisibilityExtender::new(queue.clone(), properties.clone()).unwrap();
    let delegate = FnMessageProcessor::new(move |_message: Message| async move {
        tokio::time::sleep(work).await;
        Ok(())
    });
    let decorators: Vec<Arc<dyn MessageProcessingDecorator>> = vec![Arc::new(extender.clone())];
    let processor = DecoratingMessageProcessor::new("extender-test", decorators, Arc::new(delegate));
    (extender, processor)
}

fn noop_acknowledge() -> Acknowledge {
    Acknowledge::new(Arc::new(|| async { Ok::<(), ListenerError>(()) }.boxed()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn visibility_is_extended_while_processing() {
    let queue = FakeQueue::new();
    let properties = Arc::new(TestProperties {
        max_duration: Duration::from_secs(30),
        done: AtomicUsize::new(0),
    });
    let (extender, processor) = decorated(&queue, &properties, Duration::from_millis(1_000));

    timeout(TIMEOUT, processor.process(message("slow"), noop_acknowledge()))
        .await
        .unwrap()
        .unwrap();

    // Extensions fire roughly every 300ms.
    let calls = queue.visibility_calls();
    assert!(calls.len() >= 2, "expected repeated extensions, got {}", calls.len());
    for entry in calls.iter().flatten() {
        assert_eq!(entry.id, "slow");
        assert_eq!(entry.receipt_handle, "receipt-slow");
        assert_eq!(entry.visibility_timeout, Duration::from_secs(1));
    }
    assert_eq!(extender.tracked(), 0);
    assert_eq!(properties.done.load(Ordering::SeqCst), 1);

    // Nothing is extended once processing finished.
    let after = calls.len();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(queue.visibility_calls().len(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_messages_are_never_extended() {
    let queue = FakeQueue::new();
    let properties = Arc::new(TestProperties {
        max_duration: Duration::from_secs(30),
        done: AtomicUsize::new(0),
    });
    let (extender, processor) = decorated(&queue, &properties, Duration::from_millis(20));

    for id in ["a", "b", "c"] {
        processor.process(message(id), noop_acknowledge()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(queue.visibility_calls().is_empty());
    assert_eq!(extender.tracked(), 0);
    assert_eq!(properties.done.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processing_past_max_duration_is_interrupted() {
    let queue = FakeQueue::new();
    let properties = Arc::new(TestProperties {
        max_duration: Duration::from_millis(500),
        done: AtomicUsize::new(0),
    });
    let (extender, processor) = decorated(&queue, &properties, Duration::from_secs(60));

    let started = Instant::now();
    let result = timeout(TIMEOUT, processor.process(message("stuck"), noop_acknowledge()))
        .await
        .expect("processing should be interrupted");

    assert!(matches!(result, Err(ProcessingError::Interrupted)));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(extender.tracked(), 0);
    // Interrupting and completing count as a single removal.
    assert_eq!(properties.done.load(Ordering::SeqCst), 1);
}
