//! Sending packed batches to a queue with bounded concurrency.
//!
//! Every batch call is independent: all of them are awaited to completion, successful or
//! not, before the per-message results are aggregated. A failed call never cancels the
//! others.

use std::sync::Arc;

use futures_util::future::join_all;
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::Semaphore;

use crate::{
    batch::{BatchLimits, MessageTable, Packer},
    error::Error,
    message::{Outbound, QueueResult},
    transport::{BatchOutput, QueueResolver, Transport},
};

/// Default number of batch calls in flight at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 2;

/// Options for one dispatch.
#[derive(Debug, Clone, bon::Builder)]
pub struct SendOptions {
    /// How many batch calls may be in flight at the same time
    #[builder(default = DEFAULT_CONCURRENCY_LIMIT)]
    pub concurrency_limit: usize,
    /// Body field used as the batch entry id instead of a content hash
    #[builder(into)]
    pub unique_key: Option<String>,
    /// Randomly delay each message by up to this many seconds (max 900)
    pub jitter_ceiling_seconds: Option<u32>,
    /// Seed for the jitter source, for reproducible delays
    pub seed: Option<u64>,
    #[builder(default)]
    pub limits: BatchLimits,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Packs `messages` and sends them to `queue_url`.
///
/// Returns every message exactly once, in `sent`, `failed` or `deduplicated`. The
/// returned messages carry their incremented attempt counts. An empty input returns
/// immediately without calling the transport.
#[tracing::instrument(skip_all, fields(queue_url = %queue_url, messages = messages.len()))]
pub async fn dispatch<M: Outbound>(
    transport: &dyn Transport,
    queue_url: &str,
    messages: Vec<M>,
    options: &SendOptions,
) -> QueueResult<M> {
    let mut result = QueueResult::default();

    if messages.is_empty() {
        return result;
    }

    let packer = Packer::builder()
        .limits(options.limits)
        .maybe_unique_key(options.unique_key.clone())
        .maybe_jitter_ceiling(options.jitter_ceiling_seconds)
        .build();

    let packed = {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        packer.pack(messages, &mut rng)
    };

    for rejected in packed.rejected {
        result.fail(rejected.message, rejected.error);
    }
    result.deduplicated = packed.deduplicated;

    tracing::debug!(batches = packed.batches.len(), "Sending batches");

    // Scoped to this dispatch, so concurrent dispatches never share a budget.
    let semaphore = Semaphore::new(options.concurrency_limit.max(1));

    let calls = packed.batches.into_iter().map(|batch| {
        let semaphore = &semaphore;
        async move {
            let (entries, table) = batch.into_parts();
            let outcome = match semaphore.acquire().await {
                Ok(_permit) => transport.send_batch(queue_url, entries).await,
                Err(e) => Err(eyre::Report::new(e)),
            };
            (table, outcome)
        }
    });

    for (table, outcome) in join_all(calls).await {
        settle(&mut result, table, outcome);
    }

    if !result.failed.is_empty() {
        tracing::warn!(
            sent = result.sent.len(),
            failed = result.failed.len(),
            "Some messages could not be sent"
        );
    }

    result
}

/// Moves the messages of one settled batch call into `result`.
fn settle<M>(
    result: &mut QueueResult<M>,
    mut table: MessageTable<M>,
    outcome: eyre::Result<BatchOutput>,
) {
    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "Batch call failed");
            let error = Error::TransportBatch {
                source: Arc::new(e),
            };
            for (_, message) in table.into_remaining() {
                result.fail(message, error.clone());
            }
            return;
        }
    };

    for success in output.successful {
        if let Some(message) = table.take(&success.id) {
            result.sent.push(message);
        }
    }

    for failure in output.failed {
        if let Some(message) = table.take(&failure.id) {
            result.fail(
                message,
                Error::TransportEntry {
                    id: failure.id,
                    code: failure.code,
                    sender_fault: failure.sender_fault,
                    message: failure.message,
                },
            );
        }
    }

    for (id, message) in table.into_remaining() {
        tracing::warn!(id = %id, "Entry missing from batch response");
        result.fail(message, Error::Unacknowledged { id });
    }
}

/// Resolves `queue_name` and sends `messages` to its primary queue.
pub async fn send_messages<M: Outbound>(
    transport: &dyn Transport,
    resolver: &dyn QueueResolver,
    queue_name: &str,
    messages: Vec<M>,
    options: &SendOptions,
) -> Result<QueueResult<M>, Error> {
    let urls = resolver.resolve(queue_name)?;
    Ok(dispatch(transport, &urls.primary, messages, options).await)
}

/// A sender bound to one logical queue.
#[derive(Clone)]
pub struct QueueSender {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn QueueResolver>,
    queue_name: String,
    options: SendOptions,
}

impl QueueSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn QueueResolver>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            resolver,
            queue_name: queue_name.into(),
            options: SendOptions::default(),
        }
    }

    /// Replaces the options used by [`QueueSender::send`].
    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn options(&self) -> &SendOptions {
        &self.options
    }

    pub async fn send<M: Outbound>(&self, messages: Vec<M>) -> Result<QueueResult<M>, Error> {
        self.send_with(messages, &self.options).await
    }

    pub async fn send_with<M: Outbound>(
        &self,
        messages: Vec<M>,
        options: &SendOptions,
    ) -> Result<QueueResult<M>, Error> {
        send_messages(
            self.transport.as_ref(),
            self.resolver.as_ref(),
            &self.queue_name,
            messages,
            options,
        )
        .await
    }

    /// Sends `messages` to the queue's dead-letter queue.
    pub async fn send_to_dead_letter<M: Outbound>(
        &self,
        messages: Vec<M>,
    ) -> Result<QueueResult<M>, Error> {
        let urls = self.resolver.resolve(&self.queue_name)?;
        Ok(dispatch(
            self.transport.as_ref(),
            &urls.dead_letter,
            messages,
            &self.options,
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use std::{future::Future, pin::Pin, time::Duration};

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        batch::BatchEntry,
        message::Message,
        transport::{memory::InMemoryTransport, EntryFailure, EntrySuccess, StaticQueueResolver},
    };

    fn messages(n: usize) -> Vec<Message<Value>> {
        (0..n)
            .map(|i| Message::new(json!({ "userId": i.to_string() })))
            .collect()
    }

    fn resolver() -> Arc<StaticQueueResolver> {
        Arc::new(StaticQueueResolver::new().with_queue(
            "test-queue",
            "https://sqs.local/1/test-queue",
            "https://sqs.local/1/test-queue-dlq",
        ))
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let transport = InMemoryTransport::new();

        let result = dispatch(&transport, "q", messages(0), &SendOptions::default()).await;

        assert!(result.is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_call_fails_only_its_messages() {
        let transport = InMemoryTransport::new()
            .fail_batches_when(|entries| entries.iter().any(|e| e.body.contains("\"12\"")));

        let result = dispatch(&transport, "q", messages(25), &SendOptions::default()).await;

        assert_eq!(transport.call_count(), 3);
        assert_eq!(result.sent.len(), 15);
        assert_eq!(result.failed.len(), 10);
        for failure in &result.failed {
            assert!(matches!(failure.error, Error::TransportBatch { .. }));
            let id: usize = failure.message.body["userId"].as_str().unwrap().parse().unwrap();
            assert!((10..20).contains(&id));
        }
    }

    #[tokio::test]
    async fn test_entry_failures_map_back_to_messages() {
        let transport =
            InMemoryTransport::new().fail_entries_when(|e| e.body.contains("\"3\""));

        let result = dispatch(&transport, "q", messages(5), &SendOptions::default()).await;

        assert_eq!(result.sent.len(), 4);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].message.body["userId"], "3");
        assert_eq!(result.failed[0].message.attempts, 1);
        match &result.failed[0].error {
            Error::TransportEntry {
                code, sender_fault, ..
            } => {
                assert_eq!(code, "500");
                assert!(*sender_fault);
            }
            e => panic!("Expected TransportEntry, got {e}"),
        }
    }

    /// Acknowledges every entry but the last, and also reports an id it was never sent.
    struct ForgetfulTransport;

    impl Transport for ForgetfulTransport {
        fn send_batch<'a>(
            &'a self,
            _queue_url: &'a str,
            mut entries: Vec<BatchEntry>,
        ) -> Pin<Box<dyn Future<Output = eyre::Result<BatchOutput>> + Send + 'a>> {
            Box::pin(async move {
                entries.pop();
                let mut successful: Vec<_> = entries
                    .into_iter()
                    .map(|entry| EntrySuccess {
                        message_id: format!("msg-{}", entry.id),
                        id: entry.id,
                    })
                    .collect();
                successful.push(EntrySuccess {
                    id: "not-in-this-batch".to_owned(),
                    message_id: "msg-unknown".to_owned(),
                });
                Ok(BatchOutput {
                    successful,
                    failed: vec![EntryFailure {
                        id: "also-unknown".to_owned(),
                        code: "500".to_owned(),
                        sender_fault: false,
                        message: None,
                    }],
                })
            })
        }
    }

    #[tokio::test]
    async fn test_unknown_and_missing_ids_in_response() {
        let result = dispatch(&ForgetfulTransport, "q", messages(4), &SendOptions::default()).await;

        assert_eq!(result.len(), 4);
        assert_eq!(result.sent.len(), 3);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].message.body["userId"], "3");
        match &result.failed[0].error {
            Error::Unacknowledged { id } => assert!(!id.is_empty()),
            e => panic!("Expected Unacknowledged, got {e}"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(20));
        let options = SendOptions::builder().concurrency_limit(3).build();

        let result = dispatch(&transport, "q", messages(100), &options).await;

        assert_eq!(result.sent.len(), 100);
        assert_eq!(transport.call_count(), 10);
        assert!(transport.peak_in_flight() <= 3);
        assert!(transport.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_seeded_jitter_is_reproducible() {
        let options = SendOptions::builder()
            .jitter_ceiling_seconds(600)
            .seed(99)
            .build();

        let first = InMemoryTransport::new();
        let second = InMemoryTransport::new();
        dispatch(&first, "q", messages(10), &options).await;
        dispatch(&second, "q", messages(10), &options).await;

        let delays = |t: &InMemoryTransport| -> Vec<u32> {
            t.calls()[0].entries.iter().map(|e| e.delay_seconds).collect()
        };
        assert_eq!(delays(&first), delays(&second));
        assert!(delays(&first).iter().any(|d| *d > 0));
    }

    #[tokio::test]
    async fn test_sender_targets_resolved_urls() {
        let transport = Arc::new(InMemoryTransport::new());
        let sender = QueueSender::new(transport.clone(), resolver(), "test-queue");

        sender.send(messages(1)).await.unwrap();
        sender.send_to_dead_letter(messages(1)).await.unwrap();

        let urls: Vec<_> = transport.calls().into_iter().map(|c| c.queue_url).collect();
        assert_eq!(
            urls,
            vec![
                "https://sqs.local/1/test-queue".to_owned(),
                "https://sqs.local/1/test-queue-dlq".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_sender_unknown_queue() {
        let transport = Arc::new(InMemoryTransport::new());
        let sender = QueueSender::new(transport.clone(), resolver(), "missing");

        let res = sender.send(messages(3)).await;

        assert!(matches!(res, Err(Error::QueueNotConfigured { .. })));
        assert_eq!(transport.call_count(), 0);
    }
}
