//! Per-cell enrichment: derive one attribute value for one entity.
//!
//! The grid builder computes each cell through a [`CellEnricher`]. The
//! production implementation asks the reasoning service to answer an
//! attribute query from the entity's own content; [`MockEnricher`] provides
//! a scripted, instrumented stand-in for tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use trellis_llm::{CompletionOptions, LlmError, ReasoningClient, ResponseSchema};

use crate::error::{GridError, Result};
use crate::types::{ContentItem, TableCell};

/// Behavioral preamble for enrichment calls.
const ENRICH_SYSTEM_PROMPT: &str = "You extract attribute values from supplied content. \
Answer strictly from that content. Never fabricate values, never speculate, and never \
draw on outside knowledge. When the content does not contain the requested value, \
report that it was not found.";

// ─────────────────────────────────────────────────────────────────────────────
// Enricher Trait
// ─────────────────────────────────────────────────────────────────────────────

/// One enrichment request: a natural-language query plus the content to
/// answer it from.
#[derive(Debug, Clone)]
pub struct EnrichRequest {
    /// What to derive, e.g. `"Acme - Headquarters - The city of the head office."`.
    pub query: String,

    /// The content the answer must come from.
    pub content: Vec<ContentItem>,
}

impl EnrichRequest {
    /// Create a new enrichment request.
    pub fn new(query: impl Into<String>, content: Vec<ContentItem>) -> Self {
        Self {
            query: query.into(),
            content,
        }
    }
}

/// Computes one table cell from a query and supporting content.
#[async_trait]
pub trait CellEnricher: Send + Sync {
    /// Derive a cell for the query, or `Ok(None)` when the content does not
    /// support an answer. Errors are per-call; callers decide whether they
    /// abort anything beyond the one cell.
    async fn enrich(&self, request: EnrichRequest) -> Result<Option<TableCell>>;
}

/// An enricher that can be shared across concurrent units of work.
pub type SharedEnricher = Arc<dyn CellEnricher>;

// ─────────────────────────────────────────────────────────────────────────────
// LLM Enricher
// ─────────────────────────────────────────────────────────────────────────────

/// Wire shape of the reasoning service's enrichment reply.
#[derive(Debug, Deserialize)]
struct EnrichAnswer {
    found: bool,
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    sources: Vec<String>,
}

/// Derives cell values via the reasoning service.
pub struct LlmEnricher {
    client: ReasoningClient,
}

impl LlmEnricher {
    /// Create an enricher over the given reasoning client.
    pub fn new(client: ReasoningClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CellEnricher for LlmEnricher {
    async fn enrich(&self, request: EnrichRequest) -> Result<Option<TableCell>> {
        let prompt = build_enrich_prompt(&request);

        let schema = ResponseSchema::new(
            r#"{"found": true, "text": "...", "confidence": 0.0, "sources": ["..."]}"#,
        )
        .with_note("found: false when the content does not contain the answer")
        .with_note("text: the value answering the query, taken from the content")
        .with_note("confidence: how directly the content supports the value, 0.0 to 1.0")
        .with_note("sources: urls of the content pieces the value came from");

        let options = CompletionOptions::new(schema)
            .with_system(ENRICH_SYSTEM_PROMPT)
            .with_auto_slice();

        let response = self
            .client
            .complete::<EnrichAnswer>(&prompt, &options)
            .await?;
        let answer = response.data;

        if !answer.found || answer.text.is_empty() {
            debug!(query = %request.query, "Content does not support a value");
            return Ok(None);
        }

        // Fall back to the content's own provenance when the model names
        // no sources.
        let sources = if answer.sources.is_empty() {
            request
                .content
                .iter()
                .flat_map(|item| item.urls.iter().cloned())
                .collect()
        } else {
            answer.sources
        };

        Ok(Some(TableCell::new(
            answer.text,
            answer.confidence.clamp(0.0, 1.0),
            sources,
        )))
    }
}

/// Lay out the supporting content and the query for the enrichment prompt.
fn build_enrich_prompt(request: &EnrichRequest) -> String {
    let content_len: usize = request.content.iter().map(|item| item.text.len() + 64).sum();
    let mut prompt = String::with_capacity(160 + content_len);

    prompt.push_str("Answer the query below using only the following content.\n\n<content>\n");
    for item in &request.content {
        prompt.push_str(&format!(
            "<piece title=\"{}\" urls=\"{}\">\n{}\n</piece>\n",
            item.title,
            item.urls.join(" "),
            item.text
        ));
    }
    prompt.push_str("</content>\n\n<query>");
    prompt.push_str(&request.query);
    prompt.push_str("</query>");

    prompt
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Enricher
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted enricher for testing purposes.
///
/// Answers every call with a cell echoing the query, records queries in
/// arrival order, and tracks how many calls were in flight at once.
/// Optionally delays each call and fails calls whose query contains a
/// configured needle.
#[derive(Debug, Default)]
pub struct MockEnricher {
    delay: Option<Duration>,
    fail_matching: Vec<String>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockEnricher {
    /// Create a mock enricher that answers every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each call open for `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail any call whose query contains `needle`.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_matching.push(needle.into());
        self
    }

    /// Highest number of calls in flight at any point.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// All queries received, in arrival order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl CellEnricher for MockEnricher {
    async fn enrich(&self, request: EnrichRequest) -> Result<Option<TableCell>> {
        self.queries.lock().unwrap().push(request.query.clone());

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self
            .fail_matching
            .iter()
            .any(|needle| request.query.contains(needle))
        {
            return Err(GridError::Upstream(LlmError::Backend(format!(
                "MockEnricher: forced failure for \"{}\"",
                request.query
            ))));
        }

        let sources = request
            .content
            .iter()
            .flat_map(|item| item.urls.iter().cloned())
            .collect();
        Ok(Some(TableCell::new(request.query, 0.9, sources)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_llm::{MockBackend, MockResponse};

    fn content() -> Vec<ContentItem> {
        vec![ContentItem::new(
            "Acme",
            "Acme is headquartered in Springfield.",
            vec!["https://a.example/acme".to_string()],
        )]
    }

    fn enricher_with(backend: MockBackend) -> (LlmEnricher, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let client = ReasoningClient::new(backend.clone(), "test-model");
        (LlmEnricher::new(client), backend)
    }

    #[tokio::test]
    async fn test_enrich_found_value() {
        let reply = r#"{"found": true, "text": "Springfield", "confidence": 0.8,
                        "sources": ["https://a.example/acme"]}"#;
        let (enricher, backend) = enricher_with(MockBackend::with_text(reply));

        let request = EnrichRequest::new("Acme - Headquarters - Head office city.", content());
        let cell = enricher.enrich(request).await.unwrap().unwrap();

        assert_eq!(cell.text, "Springfield");
        assert_eq!(cell.confidence, 0.8);
        assert_eq!(cell.sources, vec!["https://a.example/acme"]);

        let sent = &backend.requests()[0].messages[0].content;
        assert!(sent.contains("Acme is headquartered in Springfield."));
        assert!(sent.contains("<query>Acme - Headquarters - Head office city.</query>"));
    }

    #[tokio::test]
    async fn test_enrich_not_found_is_none() {
        let (enricher, _) = enricher_with(MockBackend::with_text(r#"{"found": false}"#));

        let request = EnrichRequest::new("Acme - Ticker - Stock symbol.", content());
        let cell = enricher.enrich(request).await.unwrap();

        assert!(cell.is_none());
    }

    #[tokio::test]
    async fn test_enrich_clamps_confidence() {
        let reply = r#"{"found": true, "text": "Springfield", "confidence": 1.7}"#;
        let (enricher, _) = enricher_with(MockBackend::with_text(reply));

        let request = EnrichRequest::new("q", content());
        let cell = enricher.enrich(request).await.unwrap().unwrap();

        assert_eq!(cell.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_enrich_defaults_sources_to_content_urls() {
        let reply = r#"{"found": true, "text": "Springfield", "confidence": 0.5, "sources": []}"#;
        let (enricher, _) = enricher_with(MockBackend::with_text(reply));

        let request = EnrichRequest::new("q", content());
        let cell = enricher.enrich(request).await.unwrap().unwrap();

        assert_eq!(cell.sources, vec!["https://a.example/acme"]);
    }

    #[tokio::test]
    async fn test_enrich_backend_failure_is_upstream() {
        let (enricher, _) = enricher_with(MockBackend::new(vec![MockResponse::Error(
            LlmError::Network("connection reset".to_string()),
        )]));

        let request = EnrichRequest::new("q", content());
        let err = enricher.enrich(request).await.unwrap_err();

        assert!(matches!(err, GridError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_mock_enricher_echoes_query() {
        let mock = MockEnricher::new();

        let request = EnrichRequest::new("Acme - HQ - city", content());
        let cell = mock.enrich(request).await.unwrap().unwrap();

        assert_eq!(cell.text, "Acme - HQ - city");
        assert_eq!(cell.sources, vec!["https://a.example/acme"]);
        assert_eq!(mock.queries(), vec!["Acme - HQ - city"]);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_enricher_forced_failure() {
        let mock = MockEnricher::new().failing_on("HQ");

        let ok = mock
            .enrich(EnrichRequest::new("Acme - Founded - year", content()))
            .await;
        assert!(ok.unwrap().is_some());

        let err = mock
            .enrich(EnrichRequest::new("Acme - HQ - city", content()))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Upstream(_)));
    }
}
