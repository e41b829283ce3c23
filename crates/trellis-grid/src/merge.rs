//! Entity deduplication over a reasoning backend.
//!
//! [`EntityMerger`] asks the reasoning service which of a list of candidate
//! entities denote the same real-world thing, then combines each returned
//! group into a single item. The decision is made on titles alone; item text
//! and provenance are only touched when a group is applied.

use serde::Deserialize;
use tracing::{debug, info};

use trellis_llm::{CompletionOptions, ReasoningClient, ResponseSchema};

use crate::error::{GridError, Result};
use crate::types::{ContentItem, MergeGroup};

/// Separator placed between member texts when a group is combined.
pub const TEXT_SEPARATOR: &str = "\n---\n";

/// Behavioral preamble for merge calls. Grounds the model in the supplied
/// titles and forbids invention.
const MERGE_SYSTEM_PROMPT: &str = "You deduplicate entities extracted from web content. \
Work only from the node titles provided. Combine nodes only when they clearly denote the \
same real-world entity, allowing for abbreviations, alternate spellings, and formatting \
differences. Never invent nodes, ids, or facts that are not in the input, and never \
speculate.";

/// Wire shape of the reasoning service's merge reply.
#[derive(Debug, Deserialize)]
struct MergePlan {
    groups: Vec<MergeGroup>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity Merger
// ─────────────────────────────────────────────────────────────────────────────

/// Deduplicates candidate entities via a single reasoning call.
pub struct EntityMerger {
    client: ReasoningClient,
}

impl EntityMerger {
    /// Create a merger over the given reasoning client.
    pub fn new(client: ReasoningClient) -> Self {
        Self { client }
    }

    /// Merge items that denote the same entity.
    ///
    /// Makes one reasoning call regardless of input size (oversized inputs
    /// are sliced by the client, not split into extra calls). Merged items
    /// come first in the returned list, followed by untouched items in their
    /// original relative order. Fails with [`GridError::SchemaViolation`] if
    /// the reply references invalid positions; merging is all-or-nothing.
    pub async fn merge(
        &self,
        items: &[ContentItem],
        entity_type: &str,
    ) -> Result<Vec<ContentItem>> {
        if items.len() < 2 {
            debug!(count = items.len(), "Skipping merge, nothing to combine");
            return Ok(items.to_vec());
        }

        let prompt = build_merge_prompt(items, entity_type);

        let schema = ResponseSchema::new(
            r#"{"groups": [{"reason": "...", "title": "...", "member_ids": [0, 1]}]}"#,
        )
        .with_note("reason: one sentence on why the nodes denote the same entity")
        .with_note("title: the combined node's replacement title")
        .with_note("member_ids: the numeric ids of the nodes to combine")
        .with_note("only include nodes that need combining; groups must not share a node")
        .with_note(r#"return {"groups": []} when no nodes denote the same entity"#);

        let options = CompletionOptions::new(schema)
            .with_system(MERGE_SYSTEM_PROMPT)
            .with_auto_slice();

        let response = self.client.complete::<MergePlan>(&prompt, &options).await?;
        let groups = response.data.groups;
        debug!(groups = groups.len(), "Received merge plan");

        let merged = apply_groups(items, &groups)?;
        info!(
            before = items.len(),
            after = merged.len(),
            groups = groups.len(),
            "Entity merge complete"
        );
        Ok(merged)
    }
}

/// Enumerate the items by position and title for the merge prompt. Text and
/// urls are deliberately not sent.
fn build_merge_prompt(items: &[ContentItem], entity_type: &str) -> String {
    let mut prompt = String::with_capacity(256 + items.len() * 48);

    prompt.push_str(
        "Given the following nodes of a knowledge graph, find any nodes that denote \
         the same entity and combine them. Only return nodes that need to be combined. \
         The nodes are of the following type:\n",
    );
    prompt.push_str(&format!("<type>{}</type>\n\n<nodes>\n", entity_type));
    for (id, item) in items.iter().enumerate() {
        prompt.push_str(&format!("<node id=\"{}\">{}</node>\n", id, item.title));
    }
    prompt.push_str("</nodes>");

    prompt
}

/// Apply validated merge groups to the input list.
///
/// Each group becomes one combined item: the group's title, member texts
/// joined with [`TEXT_SEPARATOR`] in member order, and member urls flattened
/// in member order. Items claimed by no group pass through unchanged after
/// the combined items.
///
/// Groups claiming an out-of-range position, an already-claimed position, or
/// no positions at all fail the whole merge with
/// [`GridError::SchemaViolation`].
fn apply_groups(items: &[ContentItem], groups: &[MergeGroup]) -> Result<Vec<ContentItem>> {
    let mut claimed = vec![false; items.len()];

    for group in groups {
        if group.member_ids.is_empty() {
            return Err(GridError::schema_violation(format!(
                "merge group \"{}\" has no members",
                group.title
            )));
        }
        for &id in &group.member_ids {
            if id >= items.len() {
                return Err(GridError::schema_violation(format!(
                    "merge group \"{}\" references node {} but only {} nodes exist",
                    group.title,
                    id,
                    items.len()
                )));
            }
            if claimed[id] {
                return Err(GridError::schema_violation(format!(
                    "node {} is claimed by more than one merge group",
                    id
                )));
            }
            claimed[id] = true;
        }
    }

    let mut output = Vec::with_capacity(items.len());

    for group in groups {
        let mut text = String::new();
        let mut urls = Vec::new();
        for (position, &id) in group.member_ids.iter().enumerate() {
            if position > 0 {
                text.push_str(TEXT_SEPARATOR);
            }
            text.push_str(&items[id].text);
            urls.extend(items[id].urls.iter().cloned());
        }
        output.push(ContentItem::new(group.title.clone(), text, urls));
    }

    for (id, item) in items.iter().enumerate() {
        if !claimed[id] {
            output.push(item.clone());
        }
    }

    Ok(output)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
