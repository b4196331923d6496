//! Packing of outbound messages into transport-legal batches.
//!
//! Packing is a single greedy pass over the input: each message goes into the batch
//! currently being built, and that batch is closed as soon as either the entry count
//! or the cumulative body size would exceed its limit. Input order is preserved within
//! and across batches.

use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    backoff,
    error::Error,
    message::{Outbound, SendFailure},
};

/// Maximum number of entries in one batch call.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Maximum size of a single message body, and of all bodies in a batch, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 262_144;

/// Maximum length of a batch entry id.
pub const MAX_ENTRY_ID_LEN: usize = 80;

/// One entry of a batch call, in the shape the transport sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Unique within its batch
    pub id: String,
    /// The serialized message body
    pub body: String,
    pub delay_seconds: u32,
    /// Attempt count after this send, carried as a message attribute
    pub attempts: u32,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub max_message_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_entries: MAX_BATCH_ENTRIES,
            max_bytes: MAX_MESSAGE_BYTES,
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

/// A batch under construction, keyed by entry id.
///
/// Keeps each entry next to the message it was built from so transport results can be
/// mapped back to the caller's messages.
#[derive(Debug)]
pub struct Batch<M> {
    entries: Vec<BatchEntry>,
    messages: Vec<M>,
    index: HashMap<String, usize>,
    bytes: usize,
}

impl<M> Default for Batch<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            messages: Vec::new(),
            index: HashMap::new(),
            bytes: 0,
        }
    }
}

impl<M> Batch<M> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cumulative size of the entry bodies, in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn messages(&self) -> &[M] {
        &self.messages
    }

    /// Inserts an entry, replacing any entry with the same id in place.
    ///
    /// Returns the message whose entry was replaced.
    fn insert(&mut self, entry: BatchEntry, message: M) -> Option<M> {
        match self.index.get(&entry.id) {
            Some(&i) => {
                self.bytes = self.bytes - self.entries[i].body.len() + entry.body.len();
                self.entries[i] = entry;
                Some(std::mem::replace(&mut self.messages[i], message))
            }
            None => {
                self.bytes += entry.body.len();
                self.index.insert(entry.id.clone(), self.entries.len());
                self.entries.push(entry);
                self.messages.push(message);
                None
            }
        }
    }

    /// Splits the batch into the entries to send and an id → message table.
    pub fn into_parts(self) -> (Vec<BatchEntry>, MessageTable<M>) {
        let slots = self
            .entries
            .iter()
            .map(|entry| entry.id.clone())
            .zip(self.messages.into_iter().map(Some))
            .collect();
        (
            self.entries,
            MessageTable {
                index: self.index,
                slots,
            },
        )
    }
}

/// The messages of a sent batch, looked up by entry id.
#[derive(Debug)]
pub struct MessageTable<M> {
    index: HashMap<String, usize>,
    slots: Vec<(String, Option<M>)>,
}

impl<M> MessageTable<M> {
    /// Takes the message for `id`. Unknown ids, and ids already taken, yield `None`.
    pub fn take(&mut self, id: &str) -> Option<M> {
        let &i = self.index.get(id)?;
        self.slots[i].1.take()
    }

    /// Messages not taken yet, in batch order.
    pub fn into_remaining(self) -> impl Iterator<Item = (String, M)> {
        self.slots
            .into_iter()
            .filter_map(|(id, message)| message.map(|m| (id, m)))
    }
}

/// Output of [`Packer::pack`].
#[derive(Debug)]
pub struct Packed<M> {
    pub batches: Vec<Batch<M>>,
    /// Messages that can never be sent (too large, or not serializable)
    pub rejected: Vec<SendFailure<M>>,
    /// Messages whose entry was replaced by a later message with the same id
    pub deduplicated: Vec<M>,
}

impl<M> Default for Packed<M> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            rejected: Vec::new(),
            deduplicated: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, bon::Builder)]
pub struct Packer {
    #[builder(default)]
    limits: BatchLimits,
    /// Body field whose value is used as the entry id instead of a content hash
    #[builder(into)]
    unique_key: Option<String>,
    /// Upper bound of the random delay, in seconds
    jitter_ceiling: Option<u32>,
}

impl Packer {
    /// Packs `messages` into batches.
    ///
    /// Every packed or rejected message has its `attempts` incremented once. The delay is
    /// computed from the count before the increment, and is always zero for FIFO
    /// messages.
    pub fn pack<M, R>(&self, messages: Vec<M>, rng: &mut R) -> Packed<M>
    where
        M: Outbound,
        R: Rng + ?Sized,
    {
        let mut packed = Packed::default();
        let mut current = Batch::default();

        for mut message in messages {
            let inner = message.message_mut();
            // FIFO queues only accept a queue-level delay
            let delay_seconds = if inner.is_fifo() {
                0
            } else {
                backoff::delay(inner.attempts, self.jitter_ceiling, rng)
            };
            inner.attempts = inner.attempts.saturating_add(1);
            let serialized = serde_json::to_string(&inner.body);

            let body = match serialized {
                Ok(body) => body,
                Err(e) => {
                    packed.rejected.push(SendFailure {
                        message,
                        error: e.into(),
                    });
                    continue;
                }
            };

            let bytes = body.len();
            if bytes > self.limits.max_message_bytes {
                tracing::warn!(bytes, "Message is too large to be sent");
                packed.rejected.push(SendFailure {
                    message,
                    error: Error::OversizedMessage {
                        bytes,
                        limit: self.limits.max_message_bytes,
                    },
                });
                continue;
            }

            if !current.is_empty()
                && (current.bytes() + bytes > self.limits.max_bytes
                    || current.len() >= self.limits.max_entries)
            {
                tracing::debug!(
                    entries = current.len(),
                    bytes = current.bytes(),
                    "Closing batch"
                );
                packed.batches.push(std::mem::take(&mut current));
            }

            let inner = message.message();
            let entry = BatchEntry {
                id: self.entry_id(&body),
                delay_seconds,
                attempts: inner.attempts,
                group_id: inner.delivery.group_id().map(str::to_owned),
                deduplication_id: inner.delivery.deduplication_id().map(str::to_owned),
                body,
            };

            if let Some(replaced) = current.insert(entry, message) {
                tracing::debug!("Replaced a batch entry with a duplicate id");
                packed.deduplicated.push(replaced);
            }
        }

        if !current.is_empty() {
            packed.batches.push(current);
        }

        packed
    }

    /// The entry id for a serialized body: the unique key's value if configured and
    /// present, a SHA-256 of the body otherwise. Truncated to [`MAX_ENTRY_ID_LEN`].
    fn entry_id(&self, body: &str) -> String {
        let keyed = self.unique_key.as_deref().and_then(|key| {
            let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(body) else {
                return None;
            };
            match fields.remove(key)? {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            }
        });

        match keyed {
            Some(id) if !id.is_empty() => id.chars().take(MAX_ENTRY_ID_LEN).collect(),
            _ => {
                let mut id = sha256_hex(body.as_bytes());
                id.truncate(MAX_ENTRY_ID_LEN);
                id
            }
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
