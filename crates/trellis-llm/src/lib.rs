//! Reasoning-service client for Trellis.
//!
//! This crate provides the seam between Trellis and an LLM provider: a
//! backend trait with a real Anthropic implementation and a test mock, plus
//! a structured-completion layer that constrains replies to a declared JSON
//! shape.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  ReasoningClient                         │
//! │  - complete::<T>(prompt, options)        │
//! │    schema in prompt, strict decode out   │
//! └──────────────────────────────────────────┘
//!                    │
//! ┌──────────────────────────────────────────┐
//! │  LlmBackend trait                        │
//! │  - complete(request) -> Response         │
//! └──────────────────────────────────────────┘
//!          │                    │
//!          ▼                    ▼
//!    ┌───────────┐       ┌─────────────┐
//!    │ Anthropic │       │ MockBackend │
//!    └───────────┘       └─────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod structured;
pub mod types;

// Provider implementations
pub mod anthropic;

pub use backend::{LlmBackend, MockBackend, MockResponse, SharedBackend, with_retry};
pub use error::{LlmError, RateLimitInfo, Result};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, Usage};

// Re-export provider config
pub use anthropic::{AnthropicBackend, AnthropicConfig};

// Re-export structured completion
pub use structured::{
    CompletionOptions, ReasoningClient, ResponseSchema, StructuredResponse, estimate_tokens,
};
