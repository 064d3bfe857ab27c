//! HTTP client abstraction for calling the checking webhook.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request execution,
//! enabling testability with mock implementations.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// JSON body posted to the webhook for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub token: String,
    pub numbers_or_serials: Vec<String>,
    /// RFC 3339 timestamp taken when the batch was dispatched
    pub timestamp: String,
}

impl WebhookPayload {
    pub fn new(token: impl Into<String>, identifiers: Vec<String>) -> Self {
        Self {
            token: token.into(),
            numbers_or_serials: identifiers,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One outbound webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing webhook calls.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the dispatcher testable without making real HTTP calls.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new();
/// let response = client.execute(&request, 10_000).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// POST `request.payload` as JSON to `request.url`.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The request fails due to network issues
    /// - The request times out
    /// - The URL is invalid
    async fn execute(&self, request: &WebhookRequest, timeout_ms: u64) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing client (shared connection pool, custom TLS, proxies).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(
        skip(self, request),
        fields(url = %request.url, items = request.payload.numbers_or_serials.len())
    )]
    async fn execute(&self, request: &WebhookRequest, timeout_ms: u64) -> Result<HttpResponse> {
        tracing::debug!(timeout_ms, "Executing webhook request");

        let response = self
            .client
            .post(&request.url)
            .timeout(Duration::from_millis(timeout_ms))
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %request.url, error = %e, "Webhook request failed");
                e
            })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "Webhook request completed");

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Mock HTTP client for testing.
///
/// Responses are keyed by `"POST {url}"` and served in FIFO order. When a key's
/// queue is empty the fallback response (if any) is returned instead.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "POST https://hook.example.com/check",
///     Ok(HttpResponse { status: 200, body: r#"{"results":[]}"#.to_string() }),
/// );
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    fallback: Arc<Mutex<Option<MockFallback>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    /// Immediate response
    Immediate(Result<HttpResponse>),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: Result<HttpResponse>,
        trigger: oneshot::Receiver<()>,
    },
}

type ResponderFn = Arc<dyn Fn(&WebhookRequest) -> Result<HttpResponse> + Send + Sync>;

enum MockFallback {
    Fixed(HttpResponse),
    Responder(ResponderFn),
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: String,
    pub token: String,
    pub identifiers: Vec<String>,
    pub timeout_ms: u64,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `key` (`"POST {url}"`).
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue a response that completes only once the returned sender fires (or is dropped).
    pub fn add_response_with_trigger(
        &self,
        key: &str,
        response: Result<HttpResponse>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    /// Response returned for every call whose queue is empty.
    pub fn set_fallback_response(&self, response: HttpResponse) {
        *self.fallback.lock() = Some(MockFallback::Fixed(response));
    }

    /// Compute the response from the request for every call whose queue is empty.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&WebhookRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        *self.fallback.lock() = Some(MockFallback::Responder(Arc::new(responder)));
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls currently executing. Drops when a call is aborted.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &WebhookRequest, timeout_ms: u64) -> Result<HttpResponse> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // Decrement even if the caller drops this future mid-flight
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            url: request.url.clone(),
            token: request.payload.token.clone(),
            identifiers: request.payload.numbers_or_serials.clone(),
            timeout_ms,
        });

        let key = format!("POST {}", request.url);
        let queued = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match queued {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed on send or on sender drop
                let _ = trigger.await;
                response
            }
            None => {
                let fallback = match &*self.fallback.lock() {
                    Some(MockFallback::Fixed(response)) => Some(Ok(response.clone())),
                    Some(MockFallback::Responder(responder)) => Some(responder(request)),
                    None => None,
                };
                fallback.unwrap_or_else(|| {
                    Err(crate::error::BulkCheckError::Other(anyhow::anyhow!(
                        "No mock response configured for {}",
                        key
                    )))
                })
            }
        }
    }
}
