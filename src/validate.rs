//! Classification of raw records into valid and invalid messages.
//!
//! Each record body is parsed as JSON and then passed through a [`Validator`]. Records
//! that fail either step become [`InvalidMessage`]s carrying the cause. Nothing here
//! touches the network.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::ValidationError,
    event::SqsRecord,
    message::{Delivery, InvalidMessage, Message, ValidatedMessage},
    transport::sqs::ATTEMPTS_ATTRIBUTE,
};

/// A record as delivered by the queue, before parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub message_id: String,
    pub body: String,
    /// Raw value of the `attempts` message attribute
    pub attempts_attribute: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub receipt_handle: Option<String>,
    /// ARN of the queue the record was received from
    pub event_source_arn: Option<String>,
}

impl RawRecord {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: impl ToString) -> Self {
        self.attempts_attribute = Some(attempts.to_string());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// The attempt count carried by the record.
    ///
    /// A missing or non-numeric attribute counts as attempt 0, so a record without the
    /// attribute is subject to the attempt budget like any other.
    pub fn attempts(&self) -> u32 {
        self.attempts_attribute
            .as_deref()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value as u32)
            .unwrap_or(0)
    }

    fn delivery(&self) -> Delivery {
        match &self.group_id {
            Some(group_id) => Delivery::Fifo {
                group_id: group_id.clone(),
                deduplication_id: self.deduplication_id.clone(),
            },
            None => Delivery::Standard,
        }
    }
}

impl From<SqsRecord> for RawRecord {
    fn from(mut record: SqsRecord) -> Self {
        Self {
            attempts_attribute: record
                .message_attributes
                .remove(ATTEMPTS_ATTRIBUTE)
                .and_then(|attr| attr.string_value),
            group_id: record.attributes.remove("MessageGroupId"),
            deduplication_id: record.attributes.remove("MessageDeduplicationId"),
            receipt_handle: record.receipt_handle,
            event_source_arn: record.event_source_arn,
            message_id: record.message_id,
            body: record.body,
        }
    }
}

/// Turns a parsed JSON body into a typed message body.
pub trait Validator<T>: Send + Sync {
    fn validate(&self, body: Value) -> eyre::Result<T>;
}

impl<T, F> Validator<T> for F
where
    F: Fn(Value) -> eyre::Result<T> + Send + Sync,
{
    fn validate(&self, body: Value) -> eyre::Result<T> {
        self(body)
    }
}

/// Accepts any body that deserializes into `T`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FromJson;

impl<T: DeserializeOwned> Validator<T> for FromJson {
    fn validate(&self, body: Value) -> eyre::Result<T> {
        Ok(serde_json::from_value(body)?)
    }
}

/// The two disjoint outputs of [`validate`].
#[derive(Debug, Clone)]
pub struct Validated<T> {
    pub valid: Vec<ValidatedMessage<T>>,
    pub invalid: Vec<InvalidMessage>,
}

/// Splits `records` into valid and invalid messages, preserving order in each.
pub fn validate<T>(records: &[RawRecord], validator: &dyn Validator<T>) -> Validated<T> {
    let mut validated = Validated {
        valid: Vec::with_capacity(records.len()),
        invalid: Vec::new(),
    };

    for record in records {
        let attempts = record.attempts();

        let outcome = serde_json::from_str::<Value>(&record.body)
            .map_err(ValidationError::from)
            .and_then(|body| {
                validator
                    .validate(body)
                    .map_err(|e| ValidationError::rejected(&e))
            });

        match outcome {
            Ok(body) => validated.valid.push(ValidatedMessage {
                message_id: record.message_id.clone(),
                message: Message {
                    body,
                    attempts,
                    delivery: record.delivery(),
                },
            }),
            Err(error) => validated.invalid.push(InvalidMessage {
                message_id: record.message_id.clone(),
                body: record.body.clone(),
                attempts,
                error,
            }),
        }
    }

    validated
}
