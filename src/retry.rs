//! Resilient webhook calls: per-attempt deadline, caller cancellation,
//! exponential backoff with jitter, and an offline gate.
//!
//! Each attempt resolves on whichever comes first of the response, the deadline,
//! or the caller's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{BulkCheckError, Result};
use crate::http::{HttpClient, HttpResponse, WebhookRequest};
use crate::network::DispatchSettings;

/// Predicate function to determine if a response should be retried.
pub type ShouldRetryFn = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// Default retry predicate: rate limits (429) and server errors (5xx, 503 included).
pub fn default_should_retry(response: &HttpResponse) -> bool {
    response.status == 429 || response.status == 503 || response.status >= 500
}

pub(crate) fn default_should_retry_fn() -> ShouldRetryFn {
    Arc::new(default_should_retry)
}

/// Retry behaviour for one session.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub should_retry: ShouldRetryFn,
}

impl RetryPolicy {
    pub fn new(settings: &DispatchSettings, config: &DispatcherConfig) -> Self {
        Self {
            max_retries: settings.max_retries,
            timeout_ms: settings.timeout_ms,
            base_delay_ms: settings.retry_delay_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter_ms: config.jitter_ms,
            should_retry: config.should_retry.clone(),
        }
    }

    /// `min(base * 2^attempt + jitter, cap)` with jitter uniform in `[0, jitter_ms]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(exponential.saturating_add(jitter).min(self.max_backoff_ms))
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("timeout_ms", &self.timeout_ms)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("jitter_ms", &self.jitter_ms)
            .finish_non_exhaustive()
    }
}

/// Call the webhook, retrying transient failures.
///
/// - Waits for connectivity before every attempt.
/// - Retries responses matched by `should_retry` while attempts remain; the last
///   such response is returned as-is for the caller to fail on.
/// - Retries timeouts and transport errors while attempts remain. A transport error
///   raised while the device is offline does not consume an attempt.
/// - Cancellation is never retried and returns [`BulkCheckError::Cancelled`].
pub async fn fetch_with_retry<H: HttpClient>(
    client: &H,
    request: &WebhookRequest,
    policy: &RetryPolicy,
    connectivity: &ConnectivityMonitor,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BulkCheckError::Cancelled),
            _ = connectivity.wait_until_online() => {}
        }

        match attempt_once(client, request, policy.timeout_ms, cancel).await {
            Ok(response) => {
                counter!(
                    "bulkcheck_http_attempts_total",
                    "status" => response.status.to_string()
                )
                .increment(1);

                if (policy.should_retry)(&response) && attempt < policy.max_retries {
                    let delay = policy.backoff(attempt);
                    counter!("bulkcheck_retries_total", "reason" => "http_status").increment(1);
                    tracing::warn!(
                        status = response.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retriable status from webhook, backing off"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                    continue;
                }

                return Ok(response);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                counter!("bulkcheck_http_attempts_total", "status" => "error").increment(1);

                if !connectivity.is_online() {
                    tracing::info!(
                        attempt,
                        error = %e,
                        "Attempt failed while offline, waiting to reconnect"
                    );
                    continue;
                }

                if !e.is_retriable() || attempt >= policy.max_retries {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "Webhook call failed, no retries remaining"
                    );
                    return Err(e);
                }

                let delay = policy.backoff(attempt);
                let reason = match e {
                    BulkCheckError::Timeout(_) => "timeout",
                    _ => "network",
                };
                counter!("bulkcheck_retries_total", "reason" => reason).increment(1);
                tracing::warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Webhook call failed, backing off"
                );
                sleep_or_cancel(delay, cancel).await?;
                attempt += 1;
            }
        }
    }
}

async fn attempt_once<H: HttpClient>(
    client: &H,
    request: &WebhookRequest,
    timeout_ms: u64,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BulkCheckError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            Err(BulkCheckError::Timeout(timeout_ms))
        }
        result = client.execute(request, timeout_ms) => result.map_err(|e| e.classify(timeout_ms)),
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BulkCheckError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectionInfo;
    use crate::http::{MockHttpClient, WebhookPayload};

    const URL: &str = "https://hook.example.com/check";

    fn key() -> String {
        format!("POST {URL}")
    }

    fn request() -> WebhookRequest {
        WebhookRequest {
            url: URL.to_string(),
            payload: WebhookPayload::new("tok", vec!["0895111".to_string()]),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout_ms: 1_000,
            base_delay_ms: 10,
            max_backoff_ms: 10_000,
            jitter_ms: 0,
            should_retry: default_should_retry_fn(),
        }
    }

    fn ok(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            body: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_request_on_success_without_retries() {
        let mock = MockHttpClient::new();
        mock.set_fallback_response(ok(200));

        let response = fetch_with_retry(
            &mock,
            &request(),
            &policy(0),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_on_persistent_503() {
        let mock = MockHttpClient::new();
        mock.set_fallback_response(ok(503));

        let response = fetch_with_retry(
            &mock,
            &request(),
            &policy(3),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mock = MockHttpClient::new();
        mock.set_fallback_response(ok(404));

        let response = fetch_with_retry(
            &mock,
            &request(),
            &policy(3),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_then_success() {
        let mock = MockHttpClient::new();
        mock.add_response(&key(), Ok(ok(429)));
        mock.add_response(&key(), Ok(ok(500)));
        mock.add_response(&key(), Ok(ok(200)));

        let response = fetch_with_retry(
            &mock,
            &request(),
            &policy(2),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_retried_then_propagated() {
        let mock = MockHttpClient::new();
        for _ in 0..3 {
            mock.add_response(&key(), Err(BulkCheckError::Connection("refused".into())));
        }

        let err = fetch_with_retry(
            &mock,
            &request(),
            &policy(2),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BulkCheckError::Connection(_)));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let mock = MockHttpClient::new();
        // First call never completes on its own; the deadline fires instead.
        let _never = mock.add_response_with_trigger(&key(), Ok(ok(200)));
        mock.add_response(&key(), Ok(ok(200)));

        let response = fetch_with_retry(
            &mock,
            &request(),
            &policy(1),
            &ConnectivityMonitor::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_call() {
        let mock = MockHttpClient::new();
        let _trigger = mock.add_response_with_trigger(&key(), Ok(ok(200)));
        let cancel = CancellationToken::new();

        let task = {
            let mock = mock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fetch_with_retry(
                    &mock,
                    &request(),
                    &policy(5),
                    &ConnectivityMonitor::default(),
                    &cancel,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.in_flight_count(), 1);

        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_connectivity_before_first_attempt() {
        let mock = MockHttpClient::new();
        mock.set_fallback_response(ok(200));
        let connectivity = ConnectivityMonitor::new(ConnectionInfo::offline());

        let task = {
            let mock = mock.clone();
            let connectivity = connectivity.clone();
            tokio::spawn(async move {
                fetch_with_retry(
                    &mock,
                    &request(),
                    &policy(0),
                    &connectivity,
                    &CancellationToken::new(),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.call_count(), 0);

        connectivity.set_online(true);
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let mut p = policy(5);
        p.base_delay_ms = 1_000;
        assert_eq!(p.backoff(0), Duration::from_millis(1_000));
        assert_eq!(p.backoff(2), Duration::from_millis(4_000));
        assert_eq!(p.backoff(4), Duration::from_millis(10_000));

        p.jitter_ms = 1_000;
        for attempt in 0..6 {
            let delay = p.backoff(attempt);
            let floor = (1_000u64 << attempt).min(10_000);
            assert!(delay >= Duration::from_millis(floor));
            assert!(delay <= Duration::from_millis(10_000));
        }
    }

    #[test]
    fn test_default_should_retry() {
        assert!(default_should_retry(&ok(429)));
        assert!(default_should_retry(&ok(503)));
        assert!(default_should_retry(&ok(502)));
        assert!(!default_should_retry(&ok(404)));
        assert!(!default_should_retry(&ok(408)));
        assert!(!default_should_retry(&ok(200)));
    }
}
