//! Amazon SQS implementation of the transport.
//!
//! Sends batches with `SendMessageBatch` through the AWS SDK. Works against any
//! SQS-compatible endpoint the client is configured for.

use std::{collections::HashMap, future::Future, pin::Pin};

use aws_sdk_sqs::types::{MessageAttributeValue, SendMessageBatchRequestEntry};

use crate::batch::BatchEntry;

use super::{BatchOutput, EntryFailure, EntrySuccess, Transport};

/// Name of the message attribute carrying the attempt count.
pub const ATTEMPTS_ATTRIBUTE: &str = "attempts";

/// Transport backed by an `aws_sdk_sqs::Client`.
#[derive(Clone)]
pub struct SqsTransport {
    client: aws_sdk_sqs::Client,
}

impl SqsTransport {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

fn to_request_entry(entry: BatchEntry) -> eyre::Result<SendMessageBatchRequestEntry> {
    let attempts = MessageAttributeValue::builder()
        .data_type("Number")
        .string_value(entry.attempts.to_string())
        .build()?;

    // Per-message delays are rejected by FIFO queues
    let delay_seconds = entry
        .group_id
        .is_none()
        .then_some(entry.delay_seconds as i32);

    Ok(SendMessageBatchRequestEntry::builder()
        .id(entry.id)
        .message_body(entry.body)
        .set_delay_seconds(delay_seconds)
        .message_attributes(ATTEMPTS_ATTRIBUTE, attempts)
        .set_message_group_id(entry.group_id)
        .set_message_deduplication_id(entry.deduplication_id)
        .build()?)
}

fn md5_hex(body: &str) -> String {
    hex::encode(md5::compute(body).as_ref())
}

impl Transport for SqsTransport {
    /// Sends one batch and verifies the body digest of every accepted entry.
    fn send_batch<'a>(
        &'a self,
        queue_url: &'a str,
        entries: Vec<BatchEntry>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<BatchOutput>> + Send + 'a>> {
        Box::pin(async move {
            let digests: HashMap<String, String> = entries
                .iter()
                .map(|entry| (entry.id.clone(), md5_hex(&entry.body)))
                .collect();

            let entries = entries
                .into_iter()
                .map(to_request_entry)
                .collect::<eyre::Result<Vec<_>>>()?;

            let res = self
                .client
                .send_message_batch()
                .queue_url(queue_url)
                .set_entries(Some(entries))
                .send()
                .await?;

            let mut output = BatchOutput::default();

            for success in res.successful() {
                let expected = digests.get(success.id());
                if expected.is_some_and(|digest| digest != success.md5_of_message_body()) {
                    tracing::warn!(id = success.id(), "MD5 of message body does not match");
                    output.failed.push(EntryFailure {
                        id: success.id().to_owned(),
                        code: "Md5Mismatch".to_owned(),
                        sender_fault: false,
                        message: Some(format!(
                            "queue reported digest {}",
                            success.md5_of_message_body()
                        )),
                    });
                    continue;
                }

                output.successful.push(EntrySuccess {
                    id: success.id().to_owned(),
                    message_id: success.message_id().to_owned(),
                });
            }

            output
                .failed
                .extend(res.failed().iter().map(|failure| EntryFailure {
                    id: failure.id().to_owned(),
                    code: failure.code().to_owned(),
                    sender_fault: failure.sender_fault(),
                    message: failure.message().map(str::to_owned),
                }));

            Ok(output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_entry_fields() {
        let entry = to_request_entry(BatchEntry {
            id: "abc".to_owned(),
            body: "{}".to_owned(),
            delay_seconds: 7,
            attempts: 4,
            group_id: Some("group".to_owned()),
            deduplication_id: None,
        })
        .unwrap();

        assert_eq!(entry.id(), "abc");
        assert_eq!(entry.message_body(), "{}");
        assert_eq!(entry.delay_seconds(), None);
        assert_eq!(entry.message_group_id(), Some("group"));
        assert_eq!(entry.message_deduplication_id(), None);

        let attempts = entry
            .message_attributes()
            .and_then(|attrs| attrs.get(ATTEMPTS_ATTRIBUTE))
            .unwrap();
        assert_eq!(attempts.data_type(), "Number");
        assert_eq!(attempts.string_value(), Some("4"));
    }

    #[test]
    fn test_standard_entry_keeps_delay() {
        let entry = to_request_entry(BatchEntry {
            id: "abc".to_owned(),
            body: "{}".to_owned(),
            delay_seconds: 7,
            attempts: 4,
            group_id: None,
            deduplication_id: None,
        })
        .unwrap();

        assert_eq!(entry.delay_seconds(), Some(7));
        assert_eq!(entry.message_group_id(), None);
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
