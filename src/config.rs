use std::collections::HashMap;

use serde::Deserialize;
use url::Url;

use crate::{
    dispatch::{SendOptions, DEFAULT_CONCURRENCY_LIMIT},
    error::Error,
    transport::{QueueResolver, QueueUrls},
};

const QUEUE_PREFIX: &str = "QUEUE_";
const DLQ_PREFIX: &str = "DLQ_";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub region: Option<String>,
    pub account_id: Option<String>,
    /// Base URL of an SQS-compatible server, used instead of the AWS endpoint
    pub endpoint_url: Option<Url>,
    pub concurrency_limit: Option<usize>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        let config = envy::prefixed("RELAYMQ_").from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.concurrency_limit == Some(0) {
            return Err(Error::InvalidConfig {
                message: "RELAYMQ_CONCURRENCY_LIMIT must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT)
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions::builder()
            .concurrency_limit(self.concurrency_limit())
            .build()
    }
}

/// Converts a logical queue name to the CONSTANT_CASE form used in variable names.
///
/// Word boundaries are non-alphanumeric characters and lower-to-upper case changes, so
/// `test-queue`, `test_queue` and `testQueue` all become `TEST_QUEUE`.
pub fn constant_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;

    for c in name.chars() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev = None;
            continue;
        }

        let boundary = c.is_uppercase()
            && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
        if boundary && !out.ends_with('_') {
            out.push('_');
        }

        out.extend(c.to_uppercase());
        prev = Some(c);
    }

    while out.ends_with('_') {
        out.pop();
    }

    out
}

/// Resolves queues from `QUEUE_<NAME>` / `DLQ_<NAME>` variables.
///
/// Each variable holds the physical queue name. The variables are read once, when the
/// resolver is built.
#[derive(Debug, Clone)]
pub struct EnvQueueResolver {
    base_url: String,
    vars: HashMap<String, String>,
}

impl EnvQueueResolver {
    pub fn from_env(config: &Config) -> Result<Self, Error> {
        Self::from_vars(config, std::env::vars())
    }

    pub fn from_vars(
        config: &Config,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, Error> {
        let account_id = config
            .account_id
            .as_deref()
            .ok_or_else(|| Error::missing_config("RELAYMQ_ACCOUNT_ID"))?;

        let base_url = match (&config.endpoint_url, &config.region) {
            (Some(endpoint), _) => {
                format!("{}/{account_id}", endpoint.as_str().trim_end_matches('/'))
            }
            (None, Some(region)) => format!("https://sqs.{region}.amazonaws.com/{account_id}"),
            (None, None) => return Err(Error::missing_config("RELAYMQ_REGION")),
        };

        let vars = vars
            .into_iter()
            .filter(|(key, _)| key.starts_with(QUEUE_PREFIX) || key.starts_with(DLQ_PREFIX))
            .collect();

        Ok(Self { base_url, vars })
    }

    fn url(&self, prefix: &str, constant: &str) -> Option<String> {
        self.vars
            .get(&format!("{prefix}{constant}"))
            .map(|physical| format!("{}/{physical}", self.base_url))
    }
}

impl QueueResolver for EnvQueueResolver {
    fn resolve(&self, queue_name: &str) -> Result<QueueUrls, Error> {
        let constant = constant_case(queue_name);

        match (self.url(QUEUE_PREFIX, &constant), self.url(DLQ_PREFIX, &constant)) {
            (Some(primary), Some(dead_letter)) => Ok(QueueUrls {
                primary,
                dead_letter,
            }),
            _ => {
                tracing::warn!(
                    queue = queue_name,
                    variable = %format!("{QUEUE_PREFIX}{constant}"),
                    "Queue is not configured"
                );
                Err(Error::queue_not_configured(queue_name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            region: Some("us-east-1".to_owned()),
            account_id: Some("123456789012".to_owned()),
            ..Default::default()
        }
    }

    fn vars() -> Vec<(String, String)> {
        vec![
            ("QUEUE_TEST_QUEUE".to_owned(), "test-queue".to_owned()),
            ("DLQ_TEST_QUEUE".to_owned(), "test-queue-dlq".to_owned()),
            ("QUEUE_ORPHAN".to_owned(), "orphan".to_owned()),
            ("PATH".to_owned(), "/usr/bin".to_owned()),
        ]
    }

    #[test]
    fn test_constant_case() {
        let cases = [
            ("test-queue", "TEST_QUEUE"),
            ("test_queue", "TEST_QUEUE"),
            ("testQueue", "TEST_QUEUE"),
            ("createUser", "CREATE_USER"),
            ("Jobs", "JOBS"),
            ("queue2Retry", "QUEUE2_RETRY"),
            ("  spaced  out ", "SPACED_OUT"),
            ("--a--b--", "A_B"),
        ];

        for (input, expected) in cases {
            assert_eq!(constant_case(input), expected, "input = {input:?}");
        }
    }

    #[test]
    fn test_resolve_from_vars() {
        let resolver = EnvQueueResolver::from_vars(&config(), vars()).unwrap();

        assert_eq!(
            resolver.resolve("test-queue").unwrap(),
            QueueUrls {
                primary: "https://sqs.us-east-1.amazonaws.com/123456789012/test-queue".to_owned(),
                dead_letter: "https://sqs.us-east-1.amazonaws.com/123456789012/test-queue-dlq"
                    .to_owned(),
            }
        );
        assert_eq!(resolver.vars.len(), 3);
    }

    #[test]
    fn test_missing_dead_letter_is_not_configured() {
        let resolver = EnvQueueResolver::from_vars(&config(), vars()).unwrap();

        assert!(matches!(
            resolver.resolve("orphan"),
            Err(Error::QueueNotConfigured { .. })
        ));
        assert!(matches!(
            resolver.resolve("nope"),
            Err(Error::QueueNotConfigured { .. })
        ));
    }

    #[test]
    fn test_custom_endpoint() {
        let config = Config {
            endpoint_url: Some(Url::parse("http://localhost:9324/").unwrap()),
            region: None,
            ..config()
        };
        let resolver = EnvQueueResolver::from_vars(&config, vars()).unwrap();

        assert_eq!(
            resolver.resolve("testQueue").unwrap().primary,
            "http://localhost:9324/123456789012/test-queue"
        );
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let config = Config {
            concurrency_limit: Some(0),
            ..config()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
        assert_eq!(Config::default().concurrency_limit(), DEFAULT_CONCURRENCY_LIMIT);
    }

    #[test]
    fn test_missing_account() {
        let config = Config {
            account_id: None,
            ..config()
        };

        assert!(matches!(
            EnvQueueResolver::from_vars(&config, vars()),
            Err(Error::MissingConfig { .. })
        ));
    }
}
