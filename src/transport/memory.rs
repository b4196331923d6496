//! In-memory implementation of the transport.
//!
//! Records every batch call instead of sending it anywhere, and can be told to reject
//! entries or whole batches. Primarily used for testing and local development.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::batch::BatchEntry;

use super::{BatchOutput, EntryFailure, EntrySuccess, Transport};

type EntryFilter = Arc<dyn Fn(&BatchEntry) -> bool + Send + Sync>;
type BatchFilter = Arc<dyn Fn(&[BatchEntry]) -> bool + Send + Sync>;

/// A batch call as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub queue_url: String,
    pub entries: Vec<BatchEntry>,
}

#[derive(Clone, Default)]
pub struct InMemoryTransport {
    calls: Arc<Mutex<Vec<RecordedBatch>>>,
    fail_entry: Option<EntryFilter>,
    fail_batch: Option<BatchFilter>,
    latency: Option<Duration>,
    next_id: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every entry matching `filter`, as a sender fault.
    pub fn fail_entries_when(
        mut self,
        filter: impl Fn(&BatchEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_entry = Some(Arc::new(filter));
        self
    }

    /// Fails the whole call for every batch matching `filter`.
    pub fn fail_batches_when(
        mut self,
        filter: impl Fn(&[BatchEntry]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_batch = Some(Arc::new(filter));
        self
    }

    /// Holds each call open for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every batch call received so far, in the order calls started.
    pub fn calls(&self) -> Vec<RecordedBatch> {
        self.log().clone()
    }

    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    /// The largest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The call log. Pushes are the only mutation, so the log is still complete after a
    /// panic poisoned the lock.
    fn log(&self) -> MutexGuard<'_, Vec<RecordedBatch>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, queue_url: &str, entries: &[BatchEntry]) {
        self.log().push(RecordedBatch {
            queue_url: queue_url.to_owned(),
            entries: entries.to_vec(),
        });
    }

    fn answer(&self, entries: Vec<BatchEntry>) -> eyre::Result<BatchOutput> {
        if self.fail_batch.as_ref().is_some_and(|f| f(&entries)) {
            return Err(eyre::eyre!("Batch rejected by in-memory transport"));
        }

        let mut output = BatchOutput::default();
        for entry in entries {
            if self.fail_entry.as_ref().is_some_and(|f| f(&entry)) {
                output.failed.push(EntryFailure {
                    id: entry.id,
                    code: "500".to_owned(),
                    sender_fault: true,
                    message: None,
                });
            } else {
                let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                output.successful.push(EntrySuccess {
                    id: entry.id,
                    message_id: message_id.to_string(),
                });
            }
        }

        Ok(output)
    }
}

impl Transport for InMemoryTransport {
    fn send_batch<'a>(
        &'a self,
        queue_url: &'a str,
        entries: Vec<BatchEntry>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<BatchOutput>> + Send + 'a>> {
        Box::pin(async move {
            self.record(queue_url, &entries);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let output = self.answer(entries);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            output
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, body: &str) -> BatchEntry {
        BatchEntry {
            id: id.to_owned(),
            body: body.to_owned(),
            delay_seconds: 0,
            attempts: 1,
            group_id: None,
            deduplication_id: None,
        }
    }

    #[tokio::test]
    async fn test_records_and_answers() {
        let transport = InMemoryTransport::new().fail_entries_when(|e| e.body.contains("failed"));

        let output = transport
            .send_batch("https://q/jobs", vec![entry("a", "ok"), entry("b", "failed")])
            .await
            .unwrap();

        assert_eq!(output.successful.len(), 1);
        assert_eq!(output.successful[0].id, "a");
        assert_eq!(output.failed.len(), 1);
        assert_eq!(output.failed[0].id, "b");
        assert!(output.failed[0].sender_fault);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].queue_url, "https://q/jobs");
        assert_eq!(calls[0].entries.len(), 2);
    }

    #[tokio::test]
    async fn test_poisoned_log_keeps_recording() {
        let transport = InMemoryTransport::new();
        transport.send_batch("q", vec![entry("a", "1")]).await.unwrap();

        let poisoner = transport.clone();
        let res = std::thread::spawn(move || {
            let _guard = poisoner.calls.lock().unwrap();
            panic!("poison the call log");
        })
        .join();
        assert!(res.is_err());
        assert!(transport.calls.is_poisoned());

        transport.send_batch("q", vec![entry("b", "2")]).await.unwrap();

        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.calls()[1].entries[0].id, "b");
    }

    #[tokio::test]
    async fn test_batch_failure() {
        let transport = InMemoryTransport::new().fail_batches_when(|entries| entries.len() > 1);

        assert!(transport
            .send_batch("q", vec![entry("a", "1"), entry("b", "2")])
            .await
            .is_err());
        assert!(transport.send_batch("q", vec![entry("a", "1")]).await.is_ok());
        assert_eq!(transport.call_count(), 2);
    }
}
