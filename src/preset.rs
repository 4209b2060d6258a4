//! Preset definitions and the materializer.
//!
//! A preset selects documents of one source with an ordered list of include
//! globs (one group per glob), drops anything matching an ignore glob,
//! minimizes the content, and emits the groups in declaration order. Within a
//! group, documents are ordered by [`compare_paths`].
//!
//! A path claimed by an earlier group is never emitted again by a later one.

use std::cmp::Ordering;
use std::collections::HashSet;

use globset::Glob;
use serde::Deserialize;
use tracing::debug;

use crate::archive::build_globset;
use crate::error::{PipelineError, Result};
use crate::minimize::{minimize, MinimizeOptions};
use crate::models::Document;
use crate::store::SqliteStore;

/// Named configuration selecting, ordering and transforming documents.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresetDefinition {
    /// `owner/repo` of the source to draw from.
    pub source: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Include globs, one group each, emitted in this order.
    pub include: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Removed from the front of paths when displaying them.
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Instructional text appended after the documents.
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub minimize: MinimizeOptions,
    /// Whether this preset feeds the distillation orchestrator.
    #[serde(default)]
    pub distill: bool,
    /// Distilled groupings, each persisted as its own artifact. Left empty,
    /// the preset gets one grouping named after its key covering everything.
    #[serde(default)]
    pub groups: Vec<DistillGroup>,
}

/// A named partition of distilled documents, selected by path prefix.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DistillGroup {
    pub name: String,
    /// Empty means every document.
    #[serde(default)]
    pub prefixes: Vec<String>,
}

impl DistillGroup {
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

impl DistillGroup {
    /// The grouping used when a preset declares none.
    pub fn whole_preset(preset_key: &str) -> Self {
        Self {
            name: preset_key.to_string(),
            prefixes: Vec::new(),
        }
    }
}

impl PresetDefinition {
    /// Path as shown to readers, with `strip_prefix` removed.
    pub fn display_path<'a>(&self, path: &'a str) -> &'a str {
        match &self.strip_prefix {
            Some(prefix) => path
                .strip_prefix(prefix.as_str())
                .map(|p| p.trim_start_matches('/'))
                .unwrap_or(path),
            None => path,
        }
    }
}

// ============ Ordering ============

fn is_index_file(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    stem.eq_ignore_ascii_case("index")
        || stem.eq_ignore_ascii_case("_index")
        || stem.eq_ignore_ascii_case("readme")
}

/// An index-like file stands for its directory: `a/index.md` sorts as `a/`,
/// which is a prefix of (and therefore precedes) every `a/...` path.
fn sort_key(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, file)) if is_index_file(file) => &path[..dir.len() + 1],
        None if is_index_file(path) => "",
        _ => path,
    }
}

/// Parent-before-child ordering with lexicographic fallback.
///
/// A path that is an ancestor of another (an index-like file counting as its
/// directory) sorts first; everything else is plain lexicographic order.
/// The order is total, so sorting with it is deterministic.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    sort_key(a).cmp(sort_key(b)).then_with(|| a.cmp(b))
}

// ============ Materialization ============

/// One document of a materialized bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    /// Source-relative path as stored.
    pub path: String,
    pub display_path: String,
    pub content: String,
}

/// The ordered, transformed output of a preset. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedBundle {
    pub entries: Vec<BundleEntry>,
}

impl MaterializedBundle {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Error with [`PipelineError::NoContentForPreset`] when empty.
    pub fn require_content(self, preset_key: &str) -> Result<Self> {
        if self.is_empty() {
            Err(PipelineError::NoContentForPreset(preset_key.to_string()))
        } else {
            Ok(self)
        }
    }

    /// Render as one text document: optional title header, each document
    /// under a `# path` heading, then the preset's annotation.
    pub fn render(&self, definition: &PresetDefinition) -> String {
        let mut sections: Vec<String> = Vec::with_capacity(self.entries.len() + 2);

        if let Some(title) = &definition.title {
            sections.push(format!("# Start of {} documentation", title));
        }
        for entry in &self.entries {
            sections.push(format!("# {}\n\n{}", entry.display_path, entry.content));
        }
        if let Some(annotation) = &definition.annotation {
            let annotation = annotation.trim();
            if !annotation.is_empty() {
                sections.push(annotation.to_string());
            }
        }

        let mut out = sections.join("\n\n");
        out.push('\n');
        out
    }
}

/// Evaluate `definition` against a snapshot of documents.
pub fn materialize_documents(
    docs: &[Document],
    definition: &PresetDefinition,
) -> Result<MaterializedBundle> {
    let ignore = build_globset(&definition.ignore)?;
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut entries = Vec::new();

    for pattern in &definition.include {
        let matcher = Glob::new(pattern)?.compile_matcher();

        let mut group: Vec<&Document> = docs
            .iter()
            .filter(|d| !ignore.is_match(&d.path))
            .filter(|d| matcher.is_match(&d.path))
            .filter(|d| !claimed.contains(d.path.as_str()))
            .collect();
        group.sort_by(|a, b| compare_paths(&a.path, &b.path));

        debug!(pattern = %pattern, matched = group.len(), "include group");

        for doc in group {
            claimed.insert(doc.path.as_str());
            entries.push(BundleEntry {
                path: doc.path.clone(),
                display_path: definition.display_path(&doc.path).to_string(),
                content: minimize(&doc.content, &definition.minimize),
            });
        }
    }

    Ok(MaterializedBundle { entries })
}

/// Evaluate `definition` against the current store state.
pub async fn materialize(
    store: &SqliteStore,
    definition: &PresetDefinition,
) -> Result<MaterializedBundle> {
    let docs = store.list_documents(&definition.source).await?;
    materialize_documents(&docs, definition)
}
