//! Schema-bound structured completion over a reasoning backend.
//!
//! [`ReasoningClient`] asks the model for a JSON object of a declared shape,
//! decodes the reply strictly, and retries non-conforming output a bounded
//! number of times before failing with [`LlmError::Schema`]. Malformed data
//! never leaves this boundary.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::backend::SharedBackend;
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, Message, Usage};

/// Default characters per token ratio (rough estimate for English text).
const CHARS_PER_TOKEN: usize = 4;

/// Default prompt budget in tokens, leaving headroom under common
/// 200k-token context windows.
const DEFAULT_CONTEXT_TOKENS: usize = 180_000;

/// Estimate token count for a string (rough approximation).
///
/// Uses a simple heuristic of ~4 characters per token, which is
/// reasonable for English text with the Claude/GPT tokenizers.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Declares the JSON shape a structured completion must return.
///
/// The schema is rendered into the prompt as a fenced JSON skeleton plus
/// per-field rules, and enforced on the way back by decoding into the
/// caller's target type.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    template: String,
    notes: Vec<String>,
}

impl ResponseSchema {
    /// Create a schema from a JSON skeleton, e.g. `{"groups": [...]}`.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            notes: Vec::new(),
        }
    }

    /// Add a per-field rule rendered under the skeleton.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Render the response-format section appended to every prompt.
    fn render(&self) -> String {
        let mut out = String::with_capacity(256);

        out.push_str("Return a JSON object with this structure:\n```json\n");
        out.push_str(&self.template);
        out.push_str("\n```\n");

        if !self.notes.is_empty() {
            out.push_str("\nRules:\n");
            for note in &self.notes {
                out.push_str("- ");
                out.push_str(note);
                out.push('\n');
            }
        }

        out.push_str("\nRespond with ONLY the JSON object. No markdown, no explanation.\n");
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion Options
// ─────────────────────────────────────────────────────────────────────────────

/// Options for a structured completion.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// The shape the response must decode into.
    pub schema: ResponseSchema,

    /// Behavioral system preamble (optional).
    pub system: Option<String>,

    /// Truncate oversized prompts to fit the context budget instead of
    /// failing at the provider.
    pub auto_slice: bool,

    /// Tokens reserved for the response when slicing the prompt.
    pub minimum_response_tokens: u32,

    /// Completion cap sent to the backend.
    pub max_response_tokens: u32,

    /// How many times to re-ask when the reply does not match the schema.
    pub max_attempts: u32,
}

impl CompletionOptions {
    /// Create options for the given response schema.
    pub fn new(schema: ResponseSchema) -> Self {
        Self {
            schema,
            system: None,
            auto_slice: false,
            minimum_response_tokens: 2000,
            max_response_tokens: 4096,
            max_attempts: 3,
        }
    }

    /// Set the system preamble.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Enable prompt slicing for oversized inputs.
    pub fn with_auto_slice(mut self) -> Self {
        self.auto_slice = true;
        self
    }

    /// Set the response-token floor used when slicing.
    pub fn with_minimum_response_tokens(mut self, tokens: u32) -> Self {
        self.minimum_response_tokens = tokens;
        self
    }

    /// Set the completion cap.
    pub fn with_max_response_tokens(mut self, tokens: u32) -> Self {
        self.max_response_tokens = tokens;
        self
    }

    /// Set the number of shape attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// A decoded structured completion.
#[derive(Debug, Clone)]
pub struct StructuredResponse<T> {
    /// The value decoded from the model's reply.
    pub data: T,
    /// Token usage for the final (conforming) request.
    pub usage: Usage,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reasoning Client
// ─────────────────────────────────────────────────────────────────────────────

/// Schema-constrained completion client over a shared backend.
pub struct ReasoningClient {
    backend: SharedBackend,
    model: String,
    context_tokens: usize,
}

impl ReasoningClient {
    /// Create a client for the given backend and model.
    pub fn new(backend: SharedBackend, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            context_tokens: DEFAULT_CONTEXT_TOKENS,
        }
    }

    /// Override the prompt token budget used by auto-slice.
    pub fn with_context_tokens(mut self, tokens: usize) -> Self {
        self.context_tokens = tokens;
        self
    }

    /// The model this client completes with.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Complete `prompt` and decode the reply into `T`.
    ///
    /// Backend failures propagate immediately. A reply that does not decode
    /// into `T` is retried up to `options.max_attempts` times; exhaustion
    /// yields [`LlmError::Schema`].
    pub async fn complete<T: DeserializeOwned>(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<StructuredResponse<T>> {
        let schema_section = options.schema.render();

        let body = if options.auto_slice {
            self.slice_to_budget(prompt, &schema_section, options.minimum_response_tokens)
        } else {
            prompt.to_string()
        };
        let full_prompt = format!("{}\n\n{}", body, schema_section);

        let max_attempts = options.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let mut request = CompletionRequest::new(
                &self.model,
                vec![Message::user(full_prompt.clone())],
                options.max_response_tokens,
            );
            if let Some(system) = &options.system {
                request = request.with_system(system.clone());
            }

            let response = self.backend.complete(request).await?;
            if response.is_truncated() {
                warn!(
                    model = %self.model,
                    "Structured completion hit max_tokens, output may be cut off"
                );
            }

            match decode_structured::<T>(&response.text) {
                Ok(data) => {
                    return Ok(StructuredResponse {
                        data,
                        usage: response.usage,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Response did not match the requested shape"
                    );
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no reply decoded".to_string());
        Err(LlmError::schema(format!(
            "no conforming response after {} attempts: {}",
            max_attempts, detail
        )))
    }

    /// Truncate `prompt` so prompt + schema + response fit the token budget.
    fn slice_to_budget(
        &self,
        prompt: &str,
        schema_section: &str,
        minimum_response_tokens: u32,
    ) -> String {
        let reserved = minimum_response_tokens as usize + estimate_tokens(schema_section);
        let budget = self.context_tokens.saturating_sub(reserved);

        if estimate_tokens(prompt) <= budget {
            return prompt.to_string();
        }

        let mut end = (budget * CHARS_PER_TOKEN).min(prompt.len());
        while end > 0 && !prompt.is_char_boundary(end) {
            end -= 1;
        }

        warn!(
            prompt_tokens = estimate_tokens(prompt),
            budget_tokens = budget,
            "Prompt exceeds context budget, truncating"
        );

        format!("{}\n[...input truncated to fit context...]", &prompt[..end])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decode a model reply into `T`.
///
/// Handles common failure modes: JSON wrapped in markdown code fences, and
/// JSON embedded in surrounding prose.
fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = strip_code_fences(raw);

    // Try direct parse first
    let direct_err = match serde_json::from_str::<T>(cleaned) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    // Try to find and parse a JSON object within the text
    if let Some(json_str) = extract_json_object(cleaned) {
        if let Ok(value) = serde_json::from_str::<T>(json_str) {
            return Ok(value);
        }
    }

    Err(LlmError::schema(direct_err.to_string()))
}

/// Strip markdown code fences from LLM output.
fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();

    // Strip ```json ... ``` or ``` ... ```
    if let Some(rest) = s.strip_prefix("```json") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    if let Some(rest) = s.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }

    s
}

/// Try to find a top-level JSON object `{...}` in the text.
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockResponse};
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Inventory {
        item: String,
        count: u32,
    }

    fn client_with(backend: MockBackend) -> (ReasoningClient, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let client = ReasoningClient::new(backend.clone(), "test-model");
        (client, backend)
    }

    fn options() -> CompletionOptions {
        CompletionOptions::new(
            ResponseSchema::new(r#"{"item": "...", "count": 0}"#)
                .with_note("`count` must be a non-negative integer"),
        )
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_schema_render() {
        let schema = ResponseSchema::new(r#"{"a": 1}"#).with_note("a is a number");
        let rendered = schema.render();

        assert!(rendered.contains("```json"));
        assert!(rendered.contains(r#"{"a": 1}"#));
        assert!(rendered.contains("Rules:"));
        assert!(rendered.contains("- a is a number"));
        assert!(rendered.contains("ONLY the JSON object"));
    }

    #[test]
    fn test_schema_render_no_notes() {
        let rendered = ResponseSchema::new("{}").render();
        assert!(!rendered.contains("Rules:"));
    }

    #[test]
    fn test_decode_direct() {
        let decoded: Inventory =
            decode_structured(r#"{"item": "bolt", "count": 3}"#).unwrap();
        assert_eq!(
            decoded,
            Inventory {
                item: "bolt".to_string(),
                count: 3
            }
        );
    }

    #[test]
    fn test_decode_with_code_fences() {
        let raw = "```json\n{\"item\": \"nut\", \"count\": 7}\n```";
        let decoded: Inventory = decode_structured(raw).unwrap();
        assert_eq!(decoded.item, "nut");
    }

    #[test]
    fn test_decode_with_surrounding_text() {
        let raw = "Here you go:\n\n{\"item\": \"washer\", \"count\": 1}\n\nHope that helps!";
        let decoded: Inventory = decode_structured(raw).unwrap();
        assert_eq!(decoded.item, "washer");
    }

    #[test]
    fn test_decode_malformed() {
        let result = decode_structured::<Inventory>("this is not json at all");
        assert!(matches!(result.unwrap_err(), LlmError::Schema(_)));
    }

    #[test]
    fn test_decode_wrong_shape() {
        let result = decode_structured::<Inventory>(r#"{"item": "bolt"}"#);
        assert!(matches!(result.unwrap_err(), LlmError::Schema(_)));
    }

    #[tokio::test]
    async fn test_complete_happy_path() {
        let (client, backend) =
            client_with(MockBackend::with_text(r#"{"item": "bolt", "count": 3}"#));

        let opts = options().with_system("No speculation.");
        let response: StructuredResponse<Inventory> =
            client.complete("How many bolts?", &opts).await.unwrap();

        assert_eq!(response.data.count, 3);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system.as_deref(), Some("No speculation."));
        assert!(requests[0].messages[0].content.contains("How many bolts?"));
        assert!(requests[0].messages[0].content.contains("ONLY the JSON object"));
    }

    #[tokio::test]
    async fn test_complete_retries_nonconforming_reply() {
        let (client, backend) = client_with(MockBackend::with_texts(vec![
            "sorry, I can't do JSON".to_string(),
            r#"{"item": "bolt", "count": 5}"#.to_string(),
        ]));

        let response: StructuredResponse<Inventory> =
            client.complete("How many?", &options()).await.unwrap();

        assert_eq!(response.data.count, 5);
        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn test_complete_exhausts_attempts() {
        let (client, backend) = client_with(MockBackend::with_texts(vec![
            "nope".to_string(),
            "still nope".to_string(),
            "never".to_string(),
        ]));

        let result: Result<StructuredResponse<Inventory>> =
            client.complete("How many?", &options()).await;

        assert!(matches!(result.unwrap_err(), LlmError::Schema(_)));
        assert_eq!(backend.request_count(), 3);
    }

    #[tokio::test]
    async fn test_complete_propagates_backend_error() {
        let (client, backend) = client_with(MockBackend::new(vec![MockResponse::Error(
            LlmError::Auth("bad key".to_string()),
        )]));

        let result: Result<StructuredResponse<Inventory>> =
            client.complete("How many?", &options()).await;

        assert!(matches!(result.unwrap_err(), LlmError::Auth(_)));
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_auto_slice_truncates() {
        let (client, backend) =
            client_with(MockBackend::with_text(r#"{"item": "bolt", "count": 1}"#));
        let client = client.with_context_tokens(100);

        let long_prompt = "x".repeat(4000);
        let opts = options().with_auto_slice().with_minimum_response_tokens(10);

        let response: Result<StructuredResponse<Inventory>> =
            client.complete(&long_prompt, &opts).await;
        assert!(response.is_ok());

        let sent = &backend.requests()[0].messages[0].content;
        assert!(sent.contains("[...input truncated to fit context...]"));
        assert!(sent.len() < long_prompt.len());
    }

    #[tokio::test]
    async fn test_complete_no_slice_when_within_budget() {
        let (client, backend) =
            client_with(MockBackend::with_text(r#"{"item": "bolt", "count": 1}"#));

        let opts = options().with_auto_slice();
        let _: StructuredResponse<Inventory> =
            client.complete("short prompt", &opts).await.unwrap();

        let sent = &backend.requests()[0].messages[0].content;
        assert!(!sent.contains("truncated"));
    }
}
