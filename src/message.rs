//! Message types and their lifecycle through a processing cycle.
//!
//! A [`Message`] is the unit of work that is sent to a queue. Records received from a
//! queue are turned into [`ValidatedMessage`]s (or [`InvalidMessage`]s) by the
//! validation step, handed to the user handler, and may come back as retries.
//!
//! # Message Lifecycle
//!
//! 1. A record is received and parsed
//! 2. It is validated into a `ValidatedMessage`, or kept as an `InvalidMessage`
//! 3. The handler either completes it or asks for a retry
//! 4. Retries within the attempt budget are requeued, the rest become [`FailedMessage`]s
//!
//! `attempts` is only ever mutated by the batch packer, once per dispatch attempt.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ValidationError};

/// Ordering metadata of a message.
///
/// Standard queues ignore ordering entirely. FIFO queues require a group id and accept
/// an optional deduplication id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delivery", rename_all = "camelCase")]
pub enum Delivery {
    #[default]
    Standard,
    #[serde(rename_all = "camelCase")]
    Fifo {
        group_id: String,
        deduplication_id: Option<String>,
    },
}

impl Delivery {
    pub fn fifo(group_id: impl Into<String>) -> Self {
        Self::Fifo {
            group_id: group_id.into(),
            deduplication_id: None,
        }
    }

    pub fn is_fifo(&self) -> bool {
        matches!(self, Self::Fifo { .. })
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Standard => None,
            Self::Fifo { group_id, .. } => Some(group_id),
        }
    }

    pub fn deduplication_id(&self) -> Option<&str> {
        match self {
            Self::Standard => None,
            Self::Fifo {
                deduplication_id, ..
            } => deduplication_id.as_deref(),
        }
    }
}

/// A unit of outbound or in-process work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<T> {
    /// The message payload
    pub body: T,
    /// How many times delivery or processing has been attempted
    pub attempts: u32,
    #[serde(flatten)]
    pub delivery: Delivery,
}

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            attempts: 0,
            delivery: Delivery::Standard,
        }
    }

    /// Creates a message for a FIFO queue in the given message group.
    pub fn fifo(body: T, group_id: impl Into<String>) -> Self {
        Self {
            body,
            attempts: 0,
            delivery: Delivery::fifo(group_id),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the deduplication id. Has no effect on standard messages.
    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        if let Delivery::Fifo {
            deduplication_id, ..
        } = &mut self.delivery
        {
            *deduplication_id = Some(id.into());
        }
        self
    }

    pub fn is_fifo(&self) -> bool {
        self.delivery.is_fifo()
    }
}

/// A message whose body passed validation.
///
/// `message_id` identifies the delivery it came from and is what the failure report
/// refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedMessage<T> {
    pub message_id: String,
    #[serde(flatten)]
    pub message: Message<T>,
}

impl<T> ValidatedMessage<T> {
    pub fn body(&self) -> &T {
        &self.message.body
    }

    pub fn attempts(&self) -> u32 {
        self.message.attempts
    }
}

/// A record that failed to parse or validate. Never handed to user logic as a typed
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    pub message_id: String,
    /// The raw, unparsed body
    pub body: String,
    pub attempts: u32,
    pub error: ValidationError,
}

/// A message that will not be processed again by this cycle.
#[derive(Debug, Clone)]
pub struct FailedMessage<T> {
    pub message_id: Option<String>,
    pub message: Message<T>,
    pub error: Error,
}

/// Everything a processing cycle gave up on, tagged by cause.
#[derive(Debug, Clone)]
pub enum Unprocessable<T> {
    /// Failed to parse or validate
    Invalid(InvalidMessage),
    /// Ran out of attempts
    Exhausted(FailedMessage<T>),
}

impl<T> Unprocessable<T> {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Invalid(m) => Some(&m.message_id),
            Self::Exhausted(m) => m.message_id.as_deref(),
        }
    }
}

/// Anything that can be packed and sent to a queue.
///
/// Lets the dispatcher hand back the caller's own type, so a requeued
/// [`ValidatedMessage`] keeps its `message_id` through a send.
pub trait Outbound {
    type Body: Serialize;

    fn message(&self) -> &Message<Self::Body>;

    fn message_mut(&mut self) -> &mut Message<Self::Body>;
}

impl<T: Serialize> Outbound for Message<T> {
    type Body = T;

    fn message(&self) -> &Message<T> {
        self
    }

    fn message_mut(&mut self) -> &mut Message<T> {
        self
    }
}

impl<T: Serialize> Outbound for ValidatedMessage<T> {
    type Body = T;

    fn message(&self) -> &Message<T> {
        &self.message
    }

    fn message_mut(&mut self) -> &mut Message<T> {
        &mut self.message
    }
}

/// A message that could not be sent, with the reason.
#[derive(Debug, Clone)]
pub struct SendFailure<M> {
    pub message: M,
    pub error: Error,
}

/// Aggregate outcome of one dispatch.
///
/// `sent.len() + failed.len() + deduplicated.len()` always equals the number of
/// messages passed in.
#[derive(Debug, Clone)]
pub struct QueueResult<M> {
    pub sent: Vec<M>,
    pub failed: Vec<SendFailure<M>>,
    /// Messages whose batch entry was overwritten by a later message with the same id
    pub deduplicated: Vec<M>,
}

impl<M> Default for QueueResult<M> {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            failed: Vec::new(),
            deduplicated: Vec::new(),
        }
    }
}

impl<M> QueueResult<M> {
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.failed.is_empty() && self.deduplicated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sent.len() + self.failed.len() + self.deduplicated.len()
    }

    pub(crate) fn fail(&mut self, message: M, error: Error) {
        self.failed.push(SendFailure { message, error });
    }
}
