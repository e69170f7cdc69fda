//! Retry logic for model and sandbox requests
//!
//! Transient failures are identified by HTTP status: a missing status (transport
//! failure), 408, 429 and any 5xx are retried; other statuses are final. When the
//! provider only reports text, the status is recovered from it ("HTTP 429 ...").

use std::sync::LazyLock;
use std::time::Duration;

use backon::ExponentialBuilder;
use regex::Regex;

use crate::config::LlmConfig;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl From<&LlmConfig> for RetryConfig {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_transient_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay after the given failed attempt (1-based), doubling up to `max_delay`
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = std::cmp::min(delay * 2, self.max_delay);
        }
        std::cmp::min(delay, self.max_delay)
    }
}

static STATUS_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:http|status(?:\s+code)?|error\s+code)[\s:/=]*([1-5]\d{2})\b").ok()
});

/// Find an HTTP status code mentioned in an error message
pub fn extract_status_code(detail: &str) -> Option<u16> {
    let re = STATUS_RE.as_ref()?;
    re.captures(detail)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Whether a failure with this status should be retried
pub fn is_retryable_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(408 | 429) => true,
        Some(code) => (500..600).contains(&code),
    }
}

/// Build an exponential backoff strategy from configuration
pub fn build_backoff(config: &RetryConfig) -> ExponentialBuilder {
    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.max_retries);

    if config.jitter {
        builder = builder.with_jitter();
    }

    builder
}
