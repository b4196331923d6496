//! Wire shapes exchanged with the host runtime.
//!
//! The host delivers queue records as an SQS event and expects a partial batch failure
//! report back. Only the fields this crate reads are modelled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A batch of records delivered by the event source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqsEvent {
    pub records: Vec<SqsRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsRecord {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: Option<String>,
    pub body: String,
    /// System attributes, e.g. `MessageGroupId`
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_attributes: HashMap<String, SqsMessageAttribute>,
    #[serde(default, rename = "eventSourceARN")]
    pub event_source_arn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessageAttribute {
    pub data_type: String,
    #[serde(default)]
    pub string_value: Option<String>,
}

/// One record the host must redeliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Partial batch failure report. Records not named here are acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailures {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchItemFailures {
    pub fn is_empty(&self) -> bool {
        self.batch_item_failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch_item_failures.len()
    }

    pub fn push(&mut self, id: impl Into<String>) {
        self.batch_item_failures.push(BatchItemFailure {
            item_identifier: id.into(),
        });
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
    }
}

impl FromIterator<String> for BatchItemFailures {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            batch_item_failures: iter
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }
}
