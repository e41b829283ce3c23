//! Knowledge-grid core for Trellis.
//!
//! This crate turns a list of extracted content items into a structured
//! table: it deduplicates items that denote the same real-world entity, then
//! computes one cell per (entity, field) pair with bounded concurrency,
//! tolerating individual cell failures.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  GridPipeline                                               │
//! │  - Deduplicates candidate entities                          │
//! │  - Fills the attribute grid                                 │
//! └─────────────────────────────────────────────────────────────┘
//!            │                              │
//!            ▼                              ▼
//!     ┌─────────────┐               ┌─────────────┐
//!     │ EntityMerger│               │ GridBuilder │
//!     │ (one call)  │               │ (≤10 units) │
//!     └─────────────┘               └─────────────┘
//!            │                              │
//!            ▼                              ▼
//!     ┌─────────────┐               ┌─────────────┐
//!     │ReasoningCli.│               │ CellEnricher│
//!     │(trellis-llm)│               │             │
//!     └─────────────┘               └─────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`EntityMerger`]: combines items the reasoning service groups together
//! - [`GridBuilder`]: bounded concurrent fan-out over a [`CellEnricher`]
//! - [`GridPipeline`]: merge followed by grid assembly
//! - [`Table`]: the final artifact, identity column first

pub mod enrich;
pub mod error;
pub mod grid;
pub mod merge;
pub mod pipeline;
pub mod types;

// Re-export core types
pub use error::{GridError, Result};
pub use types::{ContentItem, FieldSpec, MergeGroup, Table, TableCell};

// Re-export merger
pub use merge::{EntityMerger, TEXT_SEPARATOR};

// Re-export enrichment types
pub use enrich::{CellEnricher, EnrichRequest, LlmEnricher, MockEnricher, SharedEnricher};

// Re-export grid types
pub use grid::{
    DEFAULT_CELL_CONCURRENCY, GridBuilder, GridConfig, from_linear_index, to_linear_index,
};

// Re-export pipeline
pub use pipeline::GridPipeline;
