//! End-to-end pipeline: deduplicate entities, then fill the grid.

use tracing::info;

use crate::error::Result;
use crate::grid::GridBuilder;
use crate::merge::EntityMerger;
use crate::types::{ContentItem, FieldSpec, Table};

/// Runs entity merge and grid assembly as one operation.
///
/// The merger's output list becomes the grid's row set. A merge failure
/// aborts the run with no partial result; per-cell enrichment failures only
/// blank individual cells of the returned table.
pub struct GridPipeline {
    merger: EntityMerger,
    builder: GridBuilder,
}

impl GridPipeline {
    /// Create a pipeline from its two stages.
    pub fn new(merger: EntityMerger, builder: GridBuilder) -> Self {
        Self { merger, builder }
    }

    /// Deduplicate `items` of `entity_type`, then compute a table over the
    /// surviving entities and `fields`.
    pub async fn run(
        &self,
        items: &[ContentItem],
        entity_type: &str,
        fields: &[FieldSpec],
    ) -> Result<Table> {
        info!(
            items = items.len(),
            entity_type,
            fields = fields.len(),
            "Running knowledge grid pipeline"
        );

        let entities = self.merger.merge(items, entity_type).await?;
        self.builder.build_table(&entities, fields).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
