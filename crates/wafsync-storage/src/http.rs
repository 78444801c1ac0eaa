//! Single-attempt HTTP requests, failure classification and retry policy.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Returns the final result and the attempts used.
///
/// `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    should_retry: R,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        let result = op(attempt).await;
        attempt += 1;
        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if attempt < max_attempts && should_retry(&err) => {
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_idle_per_host: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Thin wrapper around a shared `reqwest::Client`.
///
/// Every call is one attempt; callers decide about retries with
/// [`retry_with_backoff`] so the policy is visible at the stage level.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url`, optionally conditioned on a previously seen entity tag.
    ///
    /// Any HTTP status is returned as a response; only transport failures are errors.
    pub async fn get(
        &self,
        url: &str,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, reqwest::Error> {
        let span = info_span!("http_get", url, conditional = if_none_match.is_some());
        async {
            let mut request = self.client.get(url);
            if let Some(validator) = if_none_match {
                request = request.header(IF_NONE_MATCH, validator);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let headers = resp.headers().clone();
            let body = if status == StatusCode::NOT_MODIFIED {
                Vec::new()
            } else {
                resp.bytes().await?.to_vec()
            };
            Ok::<_, reqwest::Error>(FetchedResponse {
                status,
                final_url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    fn quick_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retry_stops_after_attempt_budget() {
        let calls = Cell::new(0u32);
        let (result, attempts) = retry_with_backoff(
            &quick_policy(3),
            |_: &&str| true,
            |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>("timeout") }
            },
        )
        .await;
        assert_eq!(result, Err("timeout"));
        assert_eq!(attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_non_retryable_errors() {
        let (result, attempts) = retry_with_backoff(
            &quick_policy(5),
            |e: &&str| *e == "timeout",
            |_| async { Err::<(), _>("forbidden") },
        )
        .await;
        assert_eq!(result, Err("forbidden"));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let (result, attempts) = retry_with_backoff(
            &quick_policy(5),
            |_: &&str| true,
            |attempt| async move {
                if attempt < 2 {
                    Err("reset")
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 3);
    }
}
