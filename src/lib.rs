use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod backoff;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod transport;
pub mod validate;

pub use dispatch::{dispatch, send_messages, QueueSender, SendOptions};
pub use error::{Error, ValidationError};
pub use event::{BatchItemFailures, SqsEvent};
pub use handler::{HandlerResponse, Invocation, QueueEvent, QueueHandler, QueueHandlerDefinition};
pub use message::{
    Delivery, FailedMessage, InvalidMessage, Message, QueueResult, Unprocessable, ValidatedMessage,
};
pub use transport::{QueueResolver, QueueUrls, Transport};
pub use validate::{RawRecord, Validator};

/// Installs the global tracing subscriber.
///
/// The filter is read from `RELAYMQ_LOG` and defaults to `info`. Debug builds log in a
/// human readable format, release builds log JSON.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}
