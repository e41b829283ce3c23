//! Core data model for the knowledge grid.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Content Items
// ─────────────────────────────────────────────────────────────────────────────

/// One candidate entity: a retrieved result with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Human-readable identifier/name of the entity.
    pub title: String,

    /// The full textual content associated with the entity.
    pub text: String,

    /// Provenance: source locations the text was derived from.
    pub urls: Vec<String>,
}

impl ContentItem {
    /// Create a new content item.
    pub fn new(
        title: impl Into<String>,
        text: impl Into<String>,
        urls: Vec<String>,
    ) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            urls,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge Groups
// ─────────────────────────────────────────────────────────────────────────────

/// A proposed merge instruction from the reasoning service.
///
/// `member_ids` are zero-based positions into the merge input list. Groups
/// must be disjoint; the merger validates this before applying them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGroup {
    /// Free-text justification, kept for observability only.
    pub reason: String,

    /// The new title to assign to the merged entity.
    pub title: String,

    /// Positions of the items to combine, in combination order.
    pub member_ids: Vec<usize>,
}

impl MergeGroup {
    /// Create a new merge group.
    pub fn new(
        reason: impl Into<String>,
        title: impl Into<String>,
        member_ids: Vec<usize>,
    ) -> Self {
        Self {
            reason: reason.into(),
            title: title.into(),
            member_ids,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fields and Cells
// ─────────────────────────────────────────────────────────────────────────────

/// Describes one output column.
///
/// Both parts are used: `name` labels the column, and together with
/// `description` phrases the enrichment query for that column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column name.
    pub name: String,

    /// What the column's values should contain.
    pub description: String,
}

impl FieldSpec {
    /// Create a new field spec.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// One computed table entry.
///
/// Absent cells are represented as `Option::None` in the table, never as an
/// empty `TableCell`; `None` serializes as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    /// The computed value.
    pub text: String,

    /// Confidence in the value, in [0, 1].
    pub confidence: f64,

    /// Provenance references the value was derived from.
    pub sources: Vec<String>,
}

impl TableCell {
    /// Create a new cell.
    pub fn new(text: impl Into<String>, confidence: f64, sources: Vec<String>) -> Self {
        Self {
            text: text.into(),
            confidence,
            sources,
        }
    }

    /// The identity cell for a row entity: its own title and provenance,
    /// fully confident, computed without any external call.
    pub fn identity(item: &ContentItem) -> Self {
        Self {
            text: item.title.clone(),
            confidence: 1.0,
            sources: item.urls.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table
// ─────────────────────────────────────────────────────────────────────────────

/// The final artifact: column headers plus a row-major grid of optional
/// cells.
///
/// `columns[0]` is the synthetic identity field; every row has exactly
/// `columns.len()` entries with `rows[r][0]` always populated. Serializes as
/// `{ "columns": [...], "table": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Column headers, identity field first.
    pub columns: Vec<FieldSpec>,

    /// Row-major grid, one row per entity.
    #[serde(rename = "table")]
    pub rows: Vec<Vec<Option<TableCell>>>,
}

impl Table {
    /// Create a new table.
    pub fn new(columns: Vec<FieldSpec>, rows: Vec<Vec<Option<TableCell>>>) -> Self {
        Self { columns, rows }
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns, identity column included.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Count of populated cells across the grid.
    pub fn populated_cells(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().filter(|cell| cell.is_some()).count())
            .sum()
    }

    /// Count of absent cells across the grid.
    pub fn absent_cells(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().filter(|cell| cell.is_none()).count())
            .sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
