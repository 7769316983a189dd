//! AWS SQS queue client implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{
    BatchResultErrorEntry, ChangeMessageVisibilityBatchRequestEntry,
    DeleteMessageBatchRequestEntry, MessageSystemAttributeName,
};
use aws_sdk_sqs::Client;
use tracing::{debug, info, warn};

use sqs_listener_core::config::{AwsConfig, QueueConfig};

use crate::client::{
    BatchFailure, BatchResult, DeleteEntry, QueueClient, ReceiveRequest, VisibilityEntry,
    MAX_NUMBER_OF_MESSAGES_FROM_SQS, MAX_RECEIVE_WAIT_TIME,
};
use crate::error::QueueError;
use crate::message::Message;

/// SQS-backed queue client bound to a single queue URL.
pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
}

impl SqsQueueClient {
    /// Create a new SQS client from project config.
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        if !queue.is_configured() {
            return Err(QueueError::Request("queue URL is not configured".into()));
        }

        let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

        // Build the SQS config directly: the shared loader would also pick up
        // AWS_ENDPOINT_URL, which may belong to a different service.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region.clone())
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "sqs-listener-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        } else {
            // Only the credentials chain is taken from the shared loader.
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            sqs_config.set_credentials_provider(shared.credentials_provider());
        }

        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        let client = Client::from_conf(sqs_config.build());

        info!(
            queue_url = %queue.queue_url,
            region = %aws.region,
            "SQS queue client initialized"
        );

        Ok(Self::from_client(client, queue.queue_url.clone()))
    }

    /// Wrap an already-configured SDK client.
    pub fn from_client(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

/// Converts a received batch, skipping messages that cannot be acknowledged.
fn convert_messages(messages: Vec<aws_sdk_sqs::types::Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|msg| match convert_message(msg) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Skipping unusable SQS message");
                None
            }
        })
        .collect()
}

fn convert_message(msg: aws_sdk_sqs::types::Message) -> Result<Message, QueueError> {
    let id = msg
        .message_id()
        .ok_or_else(|| QueueError::Parse("missing message id".into()))?
        .to_string();

    let receipt_handle = msg
        .receipt_handle()
        .ok_or_else(|| QueueError::Parse(format!("message {id} has no receipt handle")))?
        .to_string();

    let attributes: HashMap<String, String> = msg
        .attributes()
        .map(|attrs| {
            attrs
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    // Only string-typed message attributes are carried.
    let message_attributes: HashMap<String, String> = msg
        .message_attributes()
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(name, value)| {
                    value.string_value().map(|v| (name.clone(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Message {
        id,
        receipt_handle,
        body: msg.body().unwrap_or("").to_string(),
        attributes,
        message_attributes,
    })
}

fn convert_failures(failed: &[BatchResultErrorEntry]) -> Vec<BatchFailure> {
    failed
        .iter()
        .map(|entry| BatchFailure {
            id: entry.id().to_string(),
            code: entry.code().to_string(),
            message: entry.message().map(str::to_string),
            sender_fault: entry.sender_fault(),
        })
        .collect()
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>, QueueError> {
        let capped = request.max_messages.clamp(1, MAX_NUMBER_OF_MESSAGES_FROM_SQS) as i32;
        let wait_secs = request.wait_time.min(MAX_RECEIVE_WAIT_TIME).as_secs() as i32;

        debug!(max_messages = capped, wait_secs, "Polling SQS");

        let mut receive = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(wait_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All");

        if let Some(timeout) = request.visibility_timeout {
            receive = receive.visibility_timeout(timeout.as_secs() as i32);
        }

        let resp = receive
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        Ok(convert_messages(sqs_messages))
    }

    async fn delete_message_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchResult, QueueError> {
        let count = entries.len();
        let entries = entries
            .into_iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_handle)
                    .build()
                    .map_err(|e| QueueError::Request(format!("invalid delete entry: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count, "Deleting SQS message batch");

        let resp = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS delete batch failed: {e:?}")))?;

        Ok(BatchResult {
            successful: resp.successful().iter().map(|e| e.id().to_string()).collect(),
            failed: convert_failures(resp.failed()),
        })
    }

    async fn change_visibility_batch(
        &self,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult, QueueError> {
        let count = entries.len();
        let entries = entries
            .into_iter()
            .map(|entry| {
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_handle)
                    .visibility_timeout(entry.visibility_timeout.as_secs() as i32)
                    .build()
                    .map_err(|e| QueueError::Request(format!("invalid visibility entry: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count, "Changing SQS message visibility");

        let resp = self
            .client
            .change_message_visibility_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(BatchResult {
            successful: resp.successful().iter().map(|e| e.id().to_string()).collect(),
            failed: convert_failures(resp.failed()),
        })
    }
}
