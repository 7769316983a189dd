//! In-memory queue used by the integration tests.
//!
//! Receives pop from a local queue and emulate a short long-poll when it is
//! empty. Every call is recorded so tests can assert on what was sent.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use sqs_listener::client::{BatchFailure, BatchResult, DeleteEntry, QueueClient, ReceiveRequest, VisibilityEntry};
use sqs_listener::{Message, QueueError};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a receive on an empty queue blocks, regardless of the requested wait.
const EMPTY_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct FakeState {
    messages: VecDeque<Message>,
    receive_calls: Vec<ReceiveRequest>,
    delete_calls: Vec<Vec<DeleteEntry>>,
    visibility_calls: Vec<Vec<VisibilityEntry>>,
    failing_receives: usize,
    failing_deletes: HashSet<String>,
    delete_delay: Duration,
}

#[derive(Default)]
pub struct FakeQueue {
    state: Mutex<FakeState>,
    receives_in_flight: AtomicUsize,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Arc<Self> {
        let queue = Self::new();
        queue.push_all(messages);
        queue
    }

    pub fn push(&self, message: Message) {
        self.state.lock().unwrap().messages.push_back(message);
    }

    pub fn push_all(&self, messages: impl IntoIterator<Item = Message>) {
        self.state.lock().unwrap().messages.extend(messages);
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// The next `count` receive calls fail with a connection error.
    pub fn fail_next_receives(&self, count: usize) {
        self.state.lock().unwrap().failing_receives = count;
    }

    /// Deletes of `id` are reported as failed entries.
    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().unwrap().failing_deletes.insert(id.to_string());
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delete_delay = delay;
    }

    pub fn receive_calls(&self) -> Vec<ReceiveRequest> {
        self.state.lock().unwrap().receive_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<Vec<DeleteEntry>> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.delete_calls()
            .into_iter()
            .flatten()
            .map(|entry| entry.id)
            .collect()
    }

    pub fn visibility_calls(&self) -> Vec<Vec<VisibilityEntry>> {
        self.state.lock().unwrap().visibility_calls.clone()
    }

    pub fn receives_in_flight(&self) -> usize {
        self.receives_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>, QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            state.receive_calls.push(request.clone());
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(QueueError::Connection("connection reset".into()));
            }
        }

        self.receives_in_flight.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + request.wait_time.min(EMPTY_POLL);
        let received = loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.messages.is_empty() {
                    let count = request.max_messages.min(state.messages.len());
                    break state.messages.drain(..count).collect::<Vec<_>>();
                }
            }
            if Instant::now() >= deadline {
                break Vec::new();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        self.receives_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(received)
    }

    async fn delete_message_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchResult, QueueError> {
        let (delay, failing) = {
            let mut state = self.state.lock().unwrap();
            state.delete_calls.push(entries.clone());
            (state.delete_delay, state.failing_deletes.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut result = BatchResult::default();
        for entry in entries {
            if failing.contains(&entry.id) {
                result.failed.push(BatchFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".into(),
                    message: Some("receipt handle expired".into()),
                    sender_fault: true,
                });
            } else {
                result.successful.push(entry.id);
            }
        }
        Ok(result)
    }

    async fn change_visibility_batch(&self, entries: Vec<VisibilityEntry>) -> Result<BatchResult, QueueError> {
        let ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
        self.state.lock().unwrap().visibility_calls.push(entries);
        Ok(BatchResult::all_successful(ids))
    }
}

pub fn message(id: &str) -> Message {
    Message::new(id, format!("receipt-{id}"), format!("body of {id}"))
}

pub fn grouped(id: &str, group: &str) -> Message {
    message(id).with_attribute(sqs_listener::message::MESSAGE_GROUP_ID, group)
}

pub fn messages(count: usize) -> Vec<Message> {
    (0..count).map(|i| message(&format!("m-{i}"))).collect()
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
