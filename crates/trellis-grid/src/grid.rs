//! Bounded concurrent grid assembly.
//!
//! [`GridBuilder`] computes one cell per (entity, field) pair through a
//! [`CellEnricher`](crate::enrich::CellEnricher), capping how many
//! computations run at once. Units are submitted row-major; completion order
//! is unconstrained, so every result is scattered back through the same
//! linear-index mapping used at submission. A failed unit costs exactly one
//! absent cell.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use trellis_llm::LlmError;

use crate::enrich::{EnrichRequest, SharedEnricher};
use crate::error::{GridError, Result};
use crate::types::{ContentItem, FieldSpec, Table, TableCell};

/// Default cap on concurrently in-flight cell computations.
pub const DEFAULT_CELL_CONCURRENCY: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Index Mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Linear unit index for a `(row, column)` position, row-major.
///
/// Submission and scatter both go through this mapping; an off-by-one here
/// would silently attribute values to the wrong entity or field.
pub fn to_linear_index(row: usize, column: usize, columns: usize) -> usize {
    row * columns + column
}

/// `(row, column)` position for a linear unit index, row-major.
pub fn from_linear_index(index: usize, columns: usize) -> (usize, usize) {
    (index / columns, index % columns)
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning for the grid builder.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Maximum concurrently in-flight cell computations.
    pub max_concurrent_cells: usize,

    /// Header for the synthesized leading identity column.
    pub identity_field: FieldSpec,

    /// Optional per-cell deadline. An elapsed deadline degrades to an
    /// absent cell like any other unit failure.
    pub cell_timeout: Option<Duration>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_concurrent_cells: DEFAULT_CELL_CONCURRENCY,
            identity_field: FieldSpec::new("Name", "The name of the entity."),
            cell_timeout: None,
        }
    }
}

impl GridConfig {
    /// Set the concurrency cap.
    pub fn with_max_concurrent_cells(mut self, limit: usize) -> Self {
        self.max_concurrent_cells = limit;
        self
    }

    /// Set the identity column header.
    pub fn with_identity_field(mut self, field: FieldSpec) -> Self {
        self.identity_field = field;
        self
    }

    /// Set a per-cell deadline.
    pub fn with_cell_timeout(mut self, timeout: Duration) -> Self {
        self.cell_timeout = Some(timeout);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Grid Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles the knowledge grid with bounded concurrent enrichment.
pub struct GridBuilder {
    enricher: SharedEnricher,
    config: GridConfig,
}

impl GridBuilder {
    /// Create a builder over the given enricher with default configuration.
    pub fn new(enricher: SharedEnricher) -> Self {
        Self {
            enricher,
            config: GridConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    /// Compute one cell per (entity, field) pair and assemble the table.
    ///
    /// At most `max_concurrent_cells` units run at once. A failed unit
    /// leaves its cell absent and never fails the batch. Every row of the
    /// result starts with a locally synthesized identity cell, followed by
    /// one entry per caller field; the row count always equals the entity
    /// count.
    pub async fn build_table(
        &self,
        entities: &[ContentItem],
        fields: &[FieldSpec],
    ) -> Result<Table> {
        let unit_count = entities.len() * fields.len();
        info!(
            rows = entities.len(),
            fields = fields.len(),
            units = unit_count,
            "Building knowledge grid"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_cells.max(1)));
        let mut handles = Vec::with_capacity(unit_count);

        for (row, entity) in entities.iter().enumerate() {
            for (column, field) in fields.iter().enumerate() {
                let unit = to_linear_index(row, column, fields.len());
                let query = format!(
                    "{} - {} - {}",
                    entity.title, field.name, field.description
                );
                let request = EnrichRequest::new(query, vec![entity.clone()]);

                let enricher = self.enricher.clone();
                let semaphore = semaphore.clone();
                let timeout = self.config.cell_timeout;

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");

                    let outcome = match timeout {
                        Some(limit) => {
                            match tokio::time::timeout(limit, enricher.enrich(request)).await {
                                Ok(outcome) => outcome,
                                Err(_) => Err(GridError::Upstream(LlmError::Network(format!(
                                    "cell computation timed out after {:?}",
                                    limit
                                )))),
                            }
                        }
                        None => enricher.enrich(request).await,
                    };

                    (unit, outcome)
                }));
            }
        }

        // Slots are pre-sized before any unit resolves; each unit scatters
        // into its own.
        let mut settled: Vec<Option<TableCell>> = vec![None; unit_count];
        for handle in handles {
            match handle.await {
                Ok((unit, Ok(cell))) => {
                    if unit >= settled.len() {
                        return Err(GridError::index_out_of_range(format!(
                            "unit {} outside {} scheduled units",
                            unit,
                            settled.len()
                        )));
                    }
                    settled[unit] = cell;
                }
                Ok((unit, Err(error))) => {
                    let (row, column) = from_linear_index(unit, fields.len());
                    warn!(
                        unit,
                        row,
                        column,
                        error = %error,
                        "Cell computation failed, leaving cell absent"
                    );
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Cell task aborted, leaving cell absent");
                }
            }
        }

        let mut rows = Vec::with_capacity(entities.len());
        for (row, entity) in entities.iter().enumerate() {
            let mut cells = Vec::with_capacity(fields.len() + 1);
            cells.push(Some(TableCell::identity(entity)));
            for column in 0..fields.len() {
                let unit = to_linear_index(row, column, fields.len());
                cells.push(settled[unit].take());
            }
            rows.push(cells);
        }

        let mut columns = Vec::with_capacity(fields.len() + 1);
        columns.push(self.config.identity_field.clone());
        columns.extend(fields.iter().cloned());

        let table = Table::new(columns, rows);
        info!(
            rows = table.row_count(),
            columns = table.column_count(),
            populated = table.populated_cells(),
            absent = table.absent_cells(),
            "Knowledge grid complete"
        );
        Ok(table)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::MockEnricher;

    fn entities(titles: &[&str]) -> Vec<ContentItem> {
        titles
            .iter()
            .map(|t| {
                ContentItem::new(
                    *t,
                    format!("{} body", t),
                    vec![format!("https://e.example/{}", t)],
                )
            })
            .collect()
    }

    fn fields(names: &[&str]) -> Vec<FieldSpec> {
        names
            .iter()
            .map(|n| FieldSpec::new(*n, format!("{} description", n)))
            .collect()
    }

    #[test]
    fn test_to_linear_index() {
        // 2 entities x 2 fields, row-major.
        assert_eq!(to_linear_index(0, 0, 2), 0);
        assert_eq!(to_linear_index(0, 1, 2), 1);
        assert_eq!(to_linear_index(1, 0, 2), 2);
        assert_eq!(to_linear_index(1, 1, 2), 3);

        assert_eq!(to_linear_index(3, 4, 7), 25);
    }

    #[test]
    fn test_from_linear_index() {
        assert_eq!(from_linear_index(0, 2), (0, 0));
        assert_eq!(from_linear_index(1, 2), (0, 1));
        assert_eq!(from_linear_index(2, 2), (1, 0));
        assert_eq!(from_linear_index(3, 2), (1, 1));
    }

    #[test]
    fn test_index_mapping_round_trips() {
        for columns in 1..=5 {
            for index in 0..(columns * 4) {
                let (row, column) = from_linear_index(index, columns);
                assert!(column < columns);
                assert_eq!(to_linear_index(row, column, columns), index);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = GridConfig::default();
        assert_eq!(config.max_concurrent_cells, 10);
        assert_eq!(config.identity_field.name, "Name");
        assert!(config.cell_timeout.is_none());
    }

    #[tokio::test]
    async fn test_grid_shape() {
        let mock = Arc::new(MockEnricher::new());
        let builder = GridBuilder::new(mock.clone());

        let table = builder
            .build_table(&entities(&["A", "B", "C"]), &fields(&["F1", "F2"]))
            .await
            .unwrap();

        assert_eq!(table.row_count(), 3);
        assert_eq!(table.column_count(), 3);
        for row in &table.rows {
            assert_eq!(row.len(), 3);
        }
        assert_eq!(mock.call_count(), 6);
    }

    #[tokio::test]
    async fn test_identity_column_is_local() {
        let mock = Arc::new(MockEnricher::new());
        let builder = GridBuilder::new(mock.clone());

        let rows = entities(&["Acme", "Globex"]);
        let table = builder.build_table(&rows, &fields(&["HQ"])).await.unwrap();

        for (r, entity) in rows.iter().enumerate() {
            let cell = table.rows[r][0].as_ref().unwrap();
            assert_eq!(cell.text, entity.title);
            assert_eq!(cell.confidence, 1.0);
            assert_eq!(cell.sources, entity.urls);
        }

        // One call per (entity, field) pair; none for the identity column.
        assert_eq!(mock.call_count(), 2);
        for query in mock.queries() {
            assert!(!query.contains("Name"));
        }
    }

    #[tokio::test]
    async fn test_queries_combine_title_and_field() {
        let mock = Arc::new(MockEnricher::new());
        let builder = GridBuilder::new(mock.clone());

        builder
            .build_table(
                &entities(&["Acme"]),
                &[FieldSpec::new("HQ", "Head office city.")],
            )
            .await
            .unwrap();

        assert_eq!(mock.queries(), vec!["Acme - HQ - Head office city."]);
    }

    #[tokio::test]
    async fn test_zero_fields() {
        let mock = Arc::new(MockEnricher::new());
        let builder = GridBuilder::new(mock.clone());

        let table = builder
            .build_table(&entities(&["A", "B"]), &[])
            .await
            .unwrap();

        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column_count(), 1);
        for row in &table.rows {
            assert_eq!(row.len(), 1);
            assert!(row[0].is_some());
        }
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_entities() {
        let mock = Arc::new(MockEnricher::new());
        let builder = GridBuilder::new(mock);

        let table = builder
            .build_table(&[], &fields(&["F1", "F2"]))
            .await
            .unwrap();

        assert_eq!(table.row_count(), 0);
        assert_eq!(table.column_count(), 3);
    }

    #[tokio::test]
    async fn test_cell_timeout_degrades_to_absent() {
        let mock = Arc::new(MockEnricher::new().with_delay(Duration::from_millis(100)));
        let builder = GridBuilder::new(mock).with_config(
            GridConfig::default().with_cell_timeout(Duration::from_millis(5)),
        );

        let table = builder
            .build_table(&entities(&["A"]), &fields(&["F1", "F2"]))
            .await
            .unwrap();

        assert!(table.rows[0][0].is_some());
        assert!(table.rows[0][1].is_none());
        assert!(table.rows[0][2].is_none());
    }
}
