//! Transport abstraction for the queueing backend.
//!
//! The dispatcher only needs two things from the outside world: a way to send one
//! batch of entries to a queue URL, and a way to map a logical queue name to the URLs
//! of its primary and dead-letter queues. Both are traits so that the AWS client, an
//! SQS-compatible server, or an in-memory fake can be plugged in.

use std::{collections::HashMap, future::Future, pin::Pin};

use crate::{batch::BatchEntry, error::Error};

pub mod memory;
pub mod sqs;

/// An accepted entry of a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySuccess {
    /// The batch-local entry id
    pub id: String,
    /// The id the transport assigned to the stored message
    pub message_id: String,
}

/// A rejected entry of a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: String,
    pub code: String,
    pub sender_fault: bool,
    pub message: Option<String>,
}

/// Per-entry outcome of one batch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutput {
    pub successful: Vec<EntrySuccess>,
    pub failed: Vec<EntryFailure>,
}

/// Core trait for sending batches to a queue.
///
/// An `Err` means the whole call failed and nothing in the batch can be assumed sent.
/// Partial failures are reported through [`BatchOutput::failed`] instead.
pub trait Transport: Send + Sync {
    fn send_batch<'a>(
        &'a self,
        queue_url: &'a str,
        entries: Vec<BatchEntry>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<BatchOutput>> + Send + 'a>>;
}

/// URLs of a queue and its dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUrls {
    pub primary: String,
    pub dead_letter: String,
}

/// Maps a logical queue name to its URLs.
pub trait QueueResolver: Send + Sync {
    fn resolve(&self, queue_name: &str) -> Result<QueueUrls, Error>;
}

/// A resolver backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticQueueResolver {
    queues: HashMap<String, QueueUrls>,
}

impl StaticQueueResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(
        mut self,
        queue_name: impl Into<String>,
        primary: impl Into<String>,
        dead_letter: impl Into<String>,
    ) -> Self {
        self.queues.insert(
            queue_name.into(),
            QueueUrls {
                primary: primary.into(),
                dead_letter: dead_letter.into(),
            },
        );
        self
    }
}

impl QueueResolver for StaticQueueResolver {
    fn resolve(&self, queue_name: &str) -> Result<QueueUrls, Error> {
        self.queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| Error::queue_not_configured(queue_name))
    }
}
