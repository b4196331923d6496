use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use relaymq::{
    config::{Config, EnvQueueResolver},
    transport::sqs::SqsTransport,
    Message, QueueSender,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Enqueues newline-delimited JSON bodies from stdin onto a logical queue.
#[tokio::main]
async fn main() -> eyre::Result<()> {
    relaymq::init_tracing()?;

    let queue_name = std::env::args()
        .nth(1)
        .ok_or_else(|| eyre::eyre!("usage: relaymq <queue-name> < messages.ndjson"))?;

    let config = Config::load()?;

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint.as_str());
    }
    let sqs = aws_sdk_sqs::Client::new(&loader.load().await);

    let resolver = EnvQueueResolver::from_env(&config)?;
    let sender = QueueSender::new(
        Arc::new(SqsTransport::new(sqs)),
        Arc::new(resolver),
        queue_name,
    )
    .with_options(config.send_options());

    let mut messages = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(body) => messages.push(Message::new(body)),
            Err(e) => tracing::warn!(line = line_no, error = %e, "Skipping malformed line"),
        }
    }

    let result = sender.send(messages).await?;

    for failure in &result.failed {
        tracing::error!(error = %failure.error, "Message was not sent");
    }

    tracing::info!(
        queue = sender.queue_name(),
        sent = result.sent.len(),
        failed = result.failed.len(),
        deduplicated = result.deduplicated.len(),
        "Done"
    );

    if !result.failed.is_empty() {
        eyre::bail!("{} message(s) could not be sent", result.failed.len());
    }

    Ok(())
}
