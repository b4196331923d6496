//! One processing cycle over a batch of delivered records.
//!
//! A [`QueueHandler`] pairs a [`QueueHandlerDefinition`] with the user's processing
//! function. Each call to [`QueueHandler::process`]:
//!
//! 1. validates the records,
//! 2. invokes the handler exactly once with the valid and invalid messages,
//! 3. splits any requested retries into requeues and exhausted messages,
//! 4. requeues onto the originating queue through the batch dispatcher,
//!
//! and produces the partial batch failure report for the host.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use futures_util::FutureExt;
use itertools::{Either, Itertools};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    dispatch::{QueueSender, SendOptions},
    error::Error,
    event::{BatchItemFailures, SqsEvent},
    message::{FailedMessage, InvalidMessage, QueueResult, Unprocessable, ValidatedMessage},
    transport::{QueueResolver, Transport},
    validate::{validate, FromJson, RawRecord, Validator},
};

/// Default number of attempts before a retried message is given up on.
pub const DEFAULT_MAXIMUM_ATTEMPTS: u32 = 10;

/// Static description of a queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHandlerDefinition {
    /// Logical name of the queue, resolved to URLs by a [`QueueResolver`]
    #[builder(into)]
    pub queue_name: String,
    /// Maximum number of records per invocation
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub max_batching_window_seconds: Option<u32>,
    /// Retries with more attempts than this are reported instead of requeued
    #[builder(default = DEFAULT_MAXIMUM_ATTEMPTS)]
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,
    #[builder(default)]
    #[serde(default)]
    pub is_fifo_queue: bool,
}

fn default_maximum_attempts() -> u32 {
    DEFAULT_MAXIMUM_ATTEMPTS
}

/// What the handler is given for one invocation.
#[derive(Debug, Clone)]
pub struct QueueEvent<T> {
    /// Every record of the batch as delivered, in delivery order
    pub records: Vec<RawRecord>,
    pub valid: Vec<ValidatedMessage<T>>,
    pub invalid: Vec<InvalidMessage>,
}

/// What the handler asks for once it is done with a batch.
#[derive(Debug, Clone)]
pub enum HandlerResponse<T> {
    /// Every valid message was processed
    Done,
    /// These messages should be processed again later
    Retry(Vec<ValidatedMessage<T>>),
}

impl<T> From<()> for HandlerResponse<T> {
    fn from(_: ()) -> Self {
        Self::Done
    }
}

impl<T> From<Vec<ValidatedMessage<T>>> for HandlerResponse<T> {
    fn from(retry: Vec<ValidatedMessage<T>>) -> Self {
        Self::Retry(retry)
    }
}

impl<T> From<Option<Vec<ValidatedMessage<T>>>> for HandlerResponse<T> {
    fn from(retry: Option<Vec<ValidatedMessage<T>>>) -> Self {
        retry.map_or(Self::Done, Self::Retry)
    }
}

/// User processing logic for one queue.
///
/// Implemented for any `Fn(QueueEvent<T>) -> impl Future<Output = eyre::Result<R>>`
/// where `R` converts into a [`HandlerResponse`], so plain async closures work.
pub trait Handler<T>: Send + Sync {
    fn call(
        &self,
        event: QueueEvent<T>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HandlerResponse<T>>> + Send + '_>>;
}

impl<T, F, Fut, R> Handler<T> for F
where
    F: Fn(QueueEvent<T>) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<R>> + Send + 'static,
    R: Into<HandlerResponse<T>>,
{
    fn call(
        &self,
        event: QueueEvent<T>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HandlerResponse<T>>> + Send + '_>> {
        let fut = self(event);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

/// Everything one processing cycle produced.
#[derive(Debug)]
pub struct Invocation<T> {
    /// The partial batch failure report for the host
    pub report: BatchItemFailures,
    /// Invalid records and retries that ran out of attempts
    pub unprocessable: Vec<Unprocessable<T>>,
    /// Outcome of sending retries back to the queue
    pub requeued: QueueResult<ValidatedMessage<T>>,
    /// Set when the handler failed and the whole batch was reported
    pub handler_error: Option<Error>,
    /// Set when retries could not be requeued at all
    pub requeue_error: Option<Error>,
}

impl<T> Invocation<T> {
    fn new() -> Self {
        Self {
            report: BatchItemFailures::default(),
            unprocessable: Vec::new(),
            requeued: QueueResult::default(),
            handler_error: None,
            requeue_error: None,
        }
    }
}

pub struct QueueHandler<T> {
    definition: QueueHandlerDefinition,
    validator: Box<dyn Validator<T>>,
    sender: QueueSender,
    handler: Box<dyn Handler<T>>,
}

impl<T> QueueHandler<T>
where
    T: Serialize + Send + 'static,
{
    /// Creates a handler whose messages are deserialized straight into `T`.
    pub fn new(
        definition: QueueHandlerDefinition,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn QueueResolver>,
        handler: impl Handler<T> + 'static,
    ) -> Self
    where
        T: DeserializeOwned,
    {
        let sender = QueueSender::new(transport, resolver, definition.queue_name.clone());
        Self {
            definition,
            validator: Box::new(FromJson),
            sender,
            handler: Box::new(handler),
        }
    }

    pub fn with_validator(mut self, validator: impl Validator<T> + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Options used when requeueing retries.
    pub fn with_send_options(mut self, options: SendOptions) -> Self {
        self.sender = self.sender.with_options(options);
        self
    }

    pub fn definition(&self) -> &QueueHandlerDefinition {
        &self.definition
    }

    /// Processes a host event and returns only the failure report.
    pub async fn handle_event(&self, event: SqsEvent) -> BatchItemFailures {
        let records = event.records.into_iter().map(RawRecord::from).collect();
        self.invoke(records).await
    }

    /// Processes `records` and returns only the failure report.
    pub async fn invoke(&self, records: Vec<RawRecord>) -> BatchItemFailures {
        self.process(records).await.report
    }

    /// Runs one full processing cycle over `records`.
    #[tracing::instrument(
        skip_all,
        fields(
            queue = %self.definition.queue_name,
            records = records.len(),
            fifo = self.definition.is_fifo_queue
        )
    )]
    pub async fn process(&self, records: Vec<RawRecord>) -> Invocation<T> {
        let mut invocation = Invocation::new();

        let validated = validate(&records, self.validator.as_ref());

        for invalid in &validated.invalid {
            tracing::warn!(
                message_id = %invalid.message_id,
                error = %invalid.error,
                "Invalid message"
            );
        }
        invocation.unprocessable.extend(
            validated
                .invalid
                .iter()
                .cloned()
                .map(Unprocessable::Invalid),
        );

        let record_ids: Vec<String> = records.iter().map(|r| r.message_id.clone()).collect();

        let event = QueueEvent {
            records,
            valid: validated.valid,
            invalid: validated.invalid,
        };

        let outcome = AssertUnwindSafe(async { self.handler.call(event).await })
            .catch_unwind()
            .await;

        let retry = match outcome {
            Ok(Ok(HandlerResponse::Done)) => return invocation,
            Ok(Ok(HandlerResponse::Retry(retry))) => retry,
            Ok(Err(e)) => {
                tracing::error!(error = ?e, "Queue handler failed, reporting the whole batch");
                invocation.handler_error = Some(Error::handler(e));
                invocation.report = record_ids.into_iter().collect();
                return invocation;
            }
            Err(panic) => {
                let e = eyre::eyre!("Queue handler panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(error = %e, "Queue handler panicked, reporting the whole batch");
                invocation.handler_error = Some(Error::handler(e));
                invocation.report = record_ids.into_iter().collect();
                return invocation;
            }
        };

        if retry.is_empty() {
            return invocation;
        }

        let maximum = self.definition.maximum_attempts;
        let (requeue, exhausted): (Vec<_>, Vec<_>) =
            retry.into_iter().partition_map(|message| {
                if message.attempts() > maximum {
                    Either::Right(message)
                } else {
                    Either::Left(message)
                }
            });

        for message in exhausted {
            tracing::warn!(
                message_id = %message.message_id,
                attempts = message.attempts(),
                maximum,
                "Message exceeded its attempt budget"
            );
            invocation.report.push(message.message_id.clone());
            invocation
                .unprocessable
                .push(Unprocessable::Exhausted(FailedMessage {
                    message_id: Some(message.message_id),
                    error: Error::AttemptBudgetExceeded {
                        attempts: message.message.attempts,
                        maximum,
                    },
                    message: message.message,
                }));
        }

        if requeue.is_empty() {
            return invocation;
        }

        let requeue: Vec<_> = requeue.into_iter().map(rederive_deduplication_id).collect();
        let ids: Vec<String> = requeue.iter().map(|m| m.message_id.clone()).collect();

        match self.sender.send(requeue).await {
            Ok(result) => {
                for failure in &result.failed {
                    tracing::warn!(
                        message_id = %failure.message.message_id,
                        error = %failure.error,
                        "Retry could not be requeued"
                    );
                    invocation.report.push(failure.message.message_id.clone());
                }
                // The surviving entry may differ in body or group, so the replaced
                // record goes back to the host for redelivery.
                for replaced in &result.deduplicated {
                    tracing::warn!(
                        message_id = %replaced.message_id,
                        "Retry was replaced by another entry with the same id"
                    );
                    invocation.report.push(replaced.message_id.clone());
                }
                invocation.requeued = result;
            }
            Err(e) => {
                tracing::error!(error = %e, "Retries could not be requeued");
                for id in ids {
                    invocation.report.push(id);
                }
                invocation.requeue_error = Some(e);
            }
        }

        invocation
    }
}

/// Gives a FIFO retry a deduplication id of its own, so the transport does not discard
/// it as a duplicate of the delivery it came from.
fn rederive_deduplication_id<T>(message: ValidatedMessage<T>) -> ValidatedMessage<T> {
    if !message.message.is_fifo() {
        return message;
    }

    let id = format!("{}-{}", message.message_id, message.attempts());
    ValidatedMessage {
        message: message.message.with_deduplication_id(id),
        message_id: message.message_id,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
