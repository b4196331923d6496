use std::sync::Arc;

use snafu::Snafu;

#[derive(Debug, Clone, Snafu)]
pub enum Error {
    #[snafu(display("Message is too large for the queue: {bytes} bytes (limit {limit})"))]
    OversizedMessage { bytes: usize, limit: usize },

    #[snafu(display("Message body could not be serialized: {message}"))]
    Serialize { message: String },

    #[snafu(display("Batch request failed: {source}"))]
    TransportBatch {
        #[snafu(source(false))]
        source: Arc<eyre::Report>,
    },

    #[snafu(display("Entry {id} was rejected ({code}, sender fault: {sender_fault})"))]
    TransportEntry {
        id: String,
        code: String,
        sender_fault: bool,
        message: Option<String>,
    },

    #[snafu(display("Entry {id} was missing from the batch response"))]
    Unacknowledged { id: String },

    #[snafu(display("Message exceeded its attempt budget: {attempts} > {maximum}"))]
    AttemptBudgetExceeded { attempts: u32, maximum: u32 },

    #[snafu(display("Queue handler failed: {source}"))]
    Handler {
        #[snafu(source(false))]
        source: Arc<eyre::Report>,
    },

    #[snafu(display("Queue {queue} is not configured"))]
    QueueNotConfigured { queue: String },

    #[snafu(display("Missing configuration: {key}"))]
    MissingConfig { key: String },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },
}

impl Error {
    pub fn handler(e: impl Into<eyre::Report>) -> Self {
        Self::Handler {
            source: Arc::new(e.into()),
        }
    }

    pub fn queue_not_configured(queue: impl Into<String>) -> Self {
        Self::QueueNotConfigured {
            queue: queue.into(),
        }
    }

    pub fn missing_config(key: impl Into<String>) -> Self {
        Self::MissingConfig { key: key.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize {
            message: e.to_string(),
        }
    }
}

/// Why a raw record could not become a validated message.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ValidationError {
    #[snafu(display("Body is not valid JSON at {line}:{column}: {message}"))]
    Parse {
        message: String,
        line: usize,
        column: usize,
    },

    #[snafu(display("Body was rejected by the validator: {message}"))]
    Rejected { message: String },
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse {
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        }
    }
}

impl ValidationError {
    pub fn rejected(e: &eyre::Report) -> Self {
        Self::Rejected {
            message: format!("{e:#}"),
        }
    }
}
