//! Reasoning-service backend trait and implementations.
//!
//! This module defines the abstraction layer over LLM providers and provides
//! a mock implementation for testing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LlmError, Result, is_retryable};
use crate::types::{CompletionRequest, CompletionResponse, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors (network failures, rate limits).
/// Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        backend = backend_name,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap())
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for reasoning-service backend providers.
///
/// Implementations of this trait provide the actual connection to LLM
/// services like Anthropic's Messages API.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the name of this backend.
    fn name(&self) -> &str;
}

/// A backend that can be shared across threads.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted reply for [`MockBackend`].
#[derive(Debug)]
pub enum MockResponse {
    /// Return a successful completion with this text.
    Text(String),
    /// Fail the request with this error.
    Error(LlmError),
}

/// A mock backend for testing purposes.
///
/// Returns pre-configured replies in order, useful for deterministic testing
/// of callers. If more requests are made than replies available, an error is
/// returned.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    replies: std::sync::Mutex<Vec<MockResponse>>,
    request_log: std::sync::Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    /// Create a new mock backend with the given scripted replies.
    pub fn new(replies: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            replies: std::sync::Mutex::new(replies),
            request_log: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text reply.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    /// Create a mock backend replying with each text in order.
    pub fn with_texts(texts: Vec<String>) -> Self {
        Self::new(texts.into_iter().map(MockResponse::Text).collect())
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().unwrap().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.request_log.lock().unwrap().push(request);

        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(LlmError::Backend(
                "MockBackend: no more responses available".to_string(),
            ));
        }

        match replies.remove(0) {
            MockResponse::Text(text) => {
                let id = format!("mock_msg_{}", self.request_log.lock().unwrap().len());
                Ok(CompletionResponse::new(
                    id,
                    "mock-model",
                    text,
                    StopReason::EndTurn,
                    Usage::new(10, 20),
                ))
            }
            MockResponse::Error(err) => Err(err),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_mock_backend_single_response() {
        let backend = MockBackend::with_text("Hello!");

        let request = CompletionRequest::new("test-model", vec![Message::user("Hi")], 100);
        let response = backend.complete(request).await.unwrap();

        assert_eq!(response.text, "Hello!");
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_multiple_responses() {
        let backend = MockBackend::with_texts(vec!["First".to_string(), "Second".to_string()]);

        let request = CompletionRequest::new("test-model", vec![Message::user("1")], 100);
        let r1 = backend.complete(request).await.unwrap();

        let request = CompletionRequest::new("test-model", vec![Message::user("2")], 100);
        let r2 = backend.complete(request).await.unwrap();

        assert_eq!(r1.text, "First");
        assert_eq!(r2.text, "Second");
        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_backend_exhausted() {
        let backend = MockBackend::new(vec![]);

        let request = CompletionRequest::new("test-model", vec![Message::user("Hi")], 100);
        let result = backend.complete(request).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_backend_scripted_error() {
        let backend = MockBackend::new(vec![
            MockResponse::Error(LlmError::Network("connection reset".to_string())),
            MockResponse::Text("recovered".to_string()),
        ]);

        let request = CompletionRequest::new("test-model", vec![Message::user("Hi")], 100);
        let err = backend.complete(request).await.unwrap_err();
        assert!(matches!(err, LlmError::Network(_)));

        let request = CompletionRequest::new("test-model", vec![Message::user("Hi")], 100);
        let response = backend.complete(request).await.unwrap();
        assert_eq!(response.text, "recovered");
    }

    #[tokio::test]
    async fn test_mock_backend_logs_requests() {
        let backend = MockBackend::with_text("ok");

        let request = CompletionRequest::new("test-model", vec![Message::user("Hi")], 100)
            .with_system("Be brief.");
        backend.complete(request).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system.as_deref(), Some("Be brief."));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);

        let result = with_retry(3, Duration::from_millis(1), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Network("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_non_retryable() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32> = with_retry(3, Duration::from_millis(1), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Auth("bad key".to_string())) }
        })
        .await;

        assert!(matches!(result.unwrap_err(), LlmError::Auth(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_retries() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32> = with_retry(2, Duration::from_millis(1), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Network("down".to_string())) }
        })
        .await;

        assert!(matches!(result.unwrap_err(), LlmError::Network(_)));
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
