//! Integration tests for the concurrent and grouping brokers.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::time::timeout;

use sqs_listener::broker::{KeepRunning, MessageConsumer, MessageSupplier};
use sqs_listener::properties::{
    StaticBatchingMessageRetrieverProperties, StaticConcurrentMessageBrokerProperties,
    StaticGroupingMessageBrokerProperties,
};
use sqs_listener::shutdown::{self, Shutdown};
use sqs_listener::{
    BatchingMessageRetriever, ConcurrentMessageBroker, GroupingMessageBroker, ListenerError, Message, MessageBroker,
    MessageRetriever, ProcessingError, WorkerPool,
};

use common::{eventually, grouped, messages, FakeQueue, TIMEOUT};

/// Processing interval of one message.
#[derive(Debug, Clone)]
struct Span {
    id: String,
    started: Instant,
    finished: Instant,
}

/// Consumer that sleeps for `work`, tracks concurrency and records spans.
#[derive(Default)]
struct Recorder {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    spans: Mutex<Vec<Span>>,
}

impl Recorder {
    fn consumer(self: &Arc<Self>, work: Duration, failing: &'static [&'static str]) -> MessageConsumer {
        let recorder = Arc::clone(self);
        Arc::new(move |message: Message| {
            let recorder = Arc::clone(&recorder);
            async move {
                let started = Instant::now();
                let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                recorder.spans.lock().unwrap().push(Span {
                    id: message.id.clone(),
                    started,
                    finished: Instant::now(),
                });
                if failing.contains(&message.id.as_str()) {
                    return Err(ProcessingError::Handler(anyhow::anyhow!("failed {}", message.id)));
                }
                Ok(())
            }
            .boxed()
        })
    }

    fn processed(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    fn span(&self, id: &str) -> Option<Span> {
        self.spans.lock().unwrap().iter().find(|span| span.id == id).cloned()
    }
}

fn vec_supplier(messages: Vec<Message>) -> (KeepRunning, MessageSupplier) {
    let remaining = Arc::new(Mutex::new(VecDeque::from(messages)));
    let keep_running: KeepRunning = {
        let remaining = Arc::clone(&remaining);
        Arc::new(move || !remaining.lock().unwrap().is_empty())
    };
    let supplier: MessageSupplier = Arc::new(move || {
        let message = remaining
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ListenerError::Internal("empty".into()))?;
        Ok(futures::future::ready(Ok(message)).boxed())
    });
    (keep_running, supplier)
}

/// Supplier that answers each call from `script`: `Some` resolves at once,
/// `None` and an exhausted script never resolve.
fn scripted_supplier(script: Vec<Option<Message>>) -> (Arc<AtomicUsize>, MessageSupplier) {
    let calls = Arc::new(AtomicUsize::new(0));
    let script = Mutex::new(VecDeque::from(script));
    let supplier: MessageSupplier = {
        let calls = Arc::clone(&calls);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            match script.lock().unwrap().pop_front() {
                Some(Some(message)) => Ok(futures::future::ready(Ok(message)).boxed()),
                _ => Ok(futures::future::pending().boxed()),
            }
        })
    };
    (calls, supplier)
}

fn retriever_supplier(queue: &Arc<FakeQueue>) -> (Arc<BatchingMessageRetriever>, MessageSupplier) {
    let retriever = Arc::new(BatchingMessageRetriever::new(
        queue.clone(),
        Arc::new(StaticBatchingMessageRetrieverProperties {
            batch_size: 3,
            batching_period: Duration::from_millis(50),
            ..Default::default()
        }),
    ));
    let supplier: MessageSupplier = {
        let retriever = Arc::clone(&retriever);
        Arc::new(move || Ok(retriever.retrieve_message()))
    };
    (retriever, supplier)
}

fn grouping_properties(concurrency_level: usize) -> StaticGroupingMessageBrokerProperties {
    StaticGroupingMessageBrokerProperties {
        concurrency: StaticConcurrentMessageBrokerProperties {
            concurrency_level,
            concurrency_polling_rate: Duration::from_millis(50),
            error_backoff_time: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

fn grouping_broker(concurrency_level: usize) -> Arc<GroupingMessageBroker> {
    Arc::new(GroupingMessageBroker::new(Arc::new(grouping_properties(concurrency_level))))
}

// ── Concurrent ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_level_is_never_exceeded() {
    let broker = ConcurrentMessageBroker::new(Arc::new(StaticConcurrentMessageBrokerProperties {
        concurrency_level: 2,
        concurrency_polling_rate: Duration::from_millis(50),
        ..Default::default()
    }));
    let pool = WorkerPool::new("concurrency-test");
    let recorder = Arc::new(Recorder::default());
    let (keep_running, supplier) = vec_supplier(messages(6));

    timeout(
        TIMEOUT,
        broker.process_messages(
            &pool,
            keep_running,
            supplier,
            recorder.consumer(Duration::from_millis(50), &[]),
            Shutdown::never(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    assert_eq!(recorder.processed(), 6);
    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(broker.in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_supplier_backs_off() {
    let broker = ConcurrentMessageBroker::new(Arc::new(StaticConcurrentMessageBrokerProperties {
        concurrency_level: 1,
        error_backoff_time: Duration::from_millis(200),
        ..Default::default()
    }));
    let pool = WorkerPool::new("backoff-test");
    let attempts = Arc::new(AtomicUsize::new(0));
    let supplier: MessageSupplier = {
        let attempts = Arc::clone(&attempts);
        Arc::new(move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ListenerError::Internal("unavailable".into()))
        })
    };
    let recorder = Arc::new(Recorder::default());

    let (trigger, shutdown) = shutdown::channel();
    let consumer = recorder.consumer(Duration::ZERO, &[]);
    let handle = tokio::spawn(async move {
        broker
            .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    trigger.trigger();
    timeout(Duration::from_secs(1), handle)
        .await
        .expect("shutdown should interrupt the backoff")
        .unwrap()
        .unwrap();

    let attempts = attempts.load(Ordering::SeqCst);
    assert!((2..=3).contains(&attempts), "unexpected attempts: {attempts}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processing_failure_is_isolated() {
    let broker = ConcurrentMessageBroker::new(Arc::new(StaticConcurrentMessageBrokerProperties {
        concurrency_level: 3,
        ..Default::default()
    }));
    let pool = WorkerPool::new("isolation-test");
    let recorder = Arc::new(Recorder::default());
    let (keep_running, supplier) = vec_supplier(messages(3));

    broker
        .process_messages(
            &pool,
            keep_running,
            supplier,
            recorder.consumer(Duration::from_millis(20), &["m-1"]),
            Shutdown::never(),
        )
        .await
        .unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    assert_eq!(recorder.processed(), 3);
    assert_eq!(broker.in_use(), 0);
}

// ── Grouping ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_in_a_group_never_overlap() {
    let queue = FakeQueue::with_messages([grouped("a-1", "A"), grouped("a-2", "A"), grouped("b-1", "B")]);
    let (retriever, supplier) = retriever_supplier(&queue);
    let (retriever_trigger, retriever_shutdown) = shutdown::channel();
    let retriever_task = {
        let retriever = Arc::clone(&retriever);
        tokio::spawn(async move { retriever.run(retriever_shutdown).await })
    };

    let broker = grouping_broker(2);
    let pool = WorkerPool::new("grouping-test");
    let recorder = Arc::new(Recorder::default());
    let (trigger, shutdown) = shutdown::channel();
    let broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = recorder.consumer(Duration::from_millis(300), &[]);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
                .await
        })
    };

    assert!(eventually(|| recorder.processed() == 3).await);
    trigger.trigger();
    timeout(TIMEOUT, broker_task).await.unwrap().unwrap().unwrap();
    retriever_trigger.trigger();
    timeout(TIMEOUT, retriever_task).await.unwrap().unwrap().unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    let a1 = recorder.span("a-1").unwrap();
    let a2 = recorder.span("a-2").unwrap();
    let b1 = recorder.span("b-1").unwrap();
    assert!(a1.finished <= a2.started, "a-2 started before a-1 finished");
    // The other group is not held up by group A.
    assert!(b1.started < a1.finished);
    assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_message_purges_rest_of_group() {
    let queue = FakeQueue::with_messages([grouped("a-1", "A"), grouped("a-2", "A"), grouped("b-1", "B")]);
    let (retriever, supplier) = retriever_supplier(&queue);
    let (retriever_trigger, retriever_shutdown) = shutdown::channel();
    let retriever_task = {
        let retriever = Arc::clone(&retriever);
        tokio::spawn(async move { retriever.run(retriever_shutdown).await })
    };

    let broker = grouping_broker(2);
    let pool = WorkerPool::new("purge-test");
    let recorder = Arc::new(Recorder::default());
    let (trigger, shutdown) = shutdown::channel();
    let broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = recorder.consumer(Duration::from_millis(100), &["a-1"]);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
                .await
        })
    };

    assert!(eventually(|| recorder.processed() == 2).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    trigger.trigger();
    timeout(TIMEOUT, broker_task).await.unwrap().unwrap().unwrap();
    retriever_trigger.trigger();
    timeout(TIMEOUT, retriever_task).await.unwrap().unwrap().unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    assert!(recorder.span("a-1").is_some());
    assert!(recorder.span("b-1").is_some());
    assert!(recorder.span("a-2").is_none());
    assert_eq!(broker.cached_groups(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_retrieval_is_processed_on_shutdown() {
    // The first retrieval never resolves, the second one does at once.
    let (calls, supplier) = scripted_supplier(vec![None, Some(grouped("a-1", "A"))]);
    let broker = Arc::new(GroupingMessageBroker::new(Arc::new(StaticGroupingMessageBrokerProperties {
        maximum_number_of_cached_message_groups: 5,
        process_cached_messages_on_shutdown: true,
        ..grouping_properties(2)
    })));
    let pool = WorkerPool::new("out-of-order-test");
    let recorder = Arc::new(Recorder::default());
    let (trigger, shutdown) = shutdown::channel();
    let broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = recorder.consumer(Duration::from_millis(20), &[]);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
                .await
        })
    };

    assert!(eventually(|| calls.load(Ordering::SeqCst) >= 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Held back behind the unresolved first retrieval.
    assert_eq!(recorder.processed(), 0);

    trigger.trigger();
    timeout(Duration::from_secs(3), broker_task)
        .await
        .expect("broker should drain its cache and return")
        .unwrap()
        .unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    assert!(recorder.span("a-1").is_some());
    assert_eq!(broker.cached_groups(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cached_messages_are_processed_after_stop() {
    let (_calls, supplier) = scripted_supplier(vec![Some(grouped("a-1", "A")), Some(grouped("a-2", "A"))]);
    let broker = Arc::new(GroupingMessageBroker::new(Arc::new(StaticGroupingMessageBrokerProperties {
        process_cached_messages_on_shutdown: true,
        ..grouping_properties(1)
    })));
    let pool = WorkerPool::new("drain-test");
    let recorder = Arc::new(Recorder::default());
    let (trigger, shutdown) = shutdown::channel();
    let broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = recorder.consumer(Duration::from_millis(300), &[]);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
                .await
        })
    };

    // a-2 waits in the cache while a-1 holds group A.
    assert!(eventually(|| broker.cached_groups() == 1).await);
    let stopped = Instant::now();
    trigger.trigger();
    timeout(TIMEOUT, broker_task).await.unwrap().unwrap().unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();

    let a1 = recorder.span("a-1").unwrap();
    let a2 = recorder.span("a-2").unwrap();
    assert!(a2.started >= stopped);
    assert!(a1.finished <= a2.started);
    assert_eq!(broker.cached_groups(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_capacity_limits_retrievals() {
    let script = (1..=6).map(|i| Some(grouped(&format!("g{i}-1"), &format!("G{i}")))).collect();
    let (calls, supplier) = scripted_supplier(script);
    let broker = Arc::new(GroupingMessageBroker::new(Arc::new(StaticGroupingMessageBrokerProperties {
        maximum_number_of_cached_message_groups: 2,
        ..grouping_properties(1)
    })));
    let pool = WorkerPool::new("capacity-test");
    let recorder = Arc::new(Recorder::default());
    let (trigger, shutdown) = shutdown::channel();
    let broker_task = {
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let consumer = recorder.consumer(Duration::from_millis(300), &[]);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, Arc::new(|| true), supplier, consumer, shutdown)
                .await
        })
    };

    // One message in processing, two groups cached, nothing else requested.
    assert!(eventually(|| broker.cached_groups() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.processed(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let mut max_cached = 0;
    let started = Instant::now();
    while recorder.processed() < 6 && started.elapsed() < TIMEOUT {
        max_cached = max_cached.max(broker.cached_groups());
        // Cached groups plus outstanding retrievals never pass the limit.
        assert!(calls.load(Ordering::SeqCst) <= recorder.processed() + 1 + 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorder.processed(), 6);
    assert!(max_cached <= 2, "cached {max_cached} groups");

    trigger.trigger();
    timeout(TIMEOUT, broker_task).await.unwrap().unwrap().unwrap();
    timeout(TIMEOUT, pool.wait_idle()).await.unwrap();
}
