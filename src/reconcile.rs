//! Hash-based reconciliation of a fresh archive against the store.
//!
//! For one source: stream every file passing the corpus filter, compare its
//! SHA-256 against the stored hash, upsert what is new or changed, then delete
//! stored paths the archive no longer contains. Unchanged files are counted
//! but never written, so re-running against an unchanged source performs no
//! writes at all.
//!
//! Upserts are flushed in chunks of `upsert_chunk_size`, one transaction per
//! chunk, and all upserts land before any deletion. A failing chunk stops the
//! run; chunks already committed stay committed (upsert is idempotent, so the
//! next run simply redoes the rest).

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive::{ingest, Matcher, RepoHost};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ReconcileError};
use crate::frontmatter;
use crate::models::{Document, ReconcileCounts, Source};
use crate::store::SqliteStore;

/// SHA-256 hex digest of a document body.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build the stored form of a freshly ingested file.
pub fn build_document(source_key: &str, path: &str, content: String, synced_at: i64) -> Document {
    let (metadata, body) = frontmatter::parse(&content);
    let title = frontmatter::title(&metadata, body, path);

    Document {
        source: source_key.to_string(),
        path: path.to_string(),
        title,
        size: content.len() as i64,
        content_hash: content_hash(&content),
        metadata_json: metadata.to_string(),
        content,
        last_synced_at: synced_at,
    }
}

struct Run<'a> {
    store: &'a SqliteStore,
    source_key: String,
    chunk_size: usize,
    counts: ReconcileCounts,
    pending: Vec<Document>,
}

impl Run<'_> {
    fn fail(self, error: PipelineError) -> ReconcileError {
        ReconcileError {
            source_key: self.source_key,
            counts: self.counts,
            error,
        }
    }

    async fn flush(&mut self) -> Result<(), PipelineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.upsert_documents(&self.pending).await?;
        self.counts.upserted += self.pending.len() as u64;
        debug!(source = %self.source_key, chunk = self.pending.len(), "upserted chunk");
        self.pending.clear();
        Ok(())
    }
}

/// Reconcile `source` against the store. `synced_at` stamps every written
/// document.
pub async fn reconcile(
    store: &SqliteStore,
    host: &dyn RepoHost,
    source: &Source,
    pipeline: &PipelineConfig,
    synced_at: i64,
) -> Result<ReconcileCounts, ReconcileError> {
    let mut run = Run {
        store,
        source_key: source.key(),
        chunk_size: pipeline.upsert_chunk_size.max(1),
        counts: ReconcileCounts::default(),
        pending: Vec::new(),
    };

    let matcher = match Matcher::new(&pipeline.include_globs, &pipeline.exclude_globs) {
        Ok(m) => m,
        Err(e) => return Err(run.fail(e)),
    };

    let existing: HashMap<String, String> = match store.document_hashes(&run.source_key).await {
        Ok(h) => h,
        Err(e) => return Err(run.fail(e)),
    };

    let mut entries = match ingest(host, source, matcher).await {
        Ok(s) => s,
        Err(e) => return Err(run.fail(e)),
    };

    let mut seen: HashSet<String> = HashSet::new();

    while let Some(entry) = entries.next().await {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => return Err(run.fail(e)),
        };

        let content = match String::from_utf8(entry.bytes) {
            Ok(c) => c,
            Err(_) => {
                warn!(source = %run.source_key, path = %entry.path, "skipping non-UTF-8 file");
                continue;
            }
        };

        let hash = content_hash(&content);
        let unchanged = existing.get(&entry.path) == Some(&hash);
        seen.insert(entry.path.clone());

        if unchanged {
            run.counts.unchanged += 1;
            continue;
        }

        run.pending
            .push(build_document(&run.source_key, &entry.path, content, synced_at));
        if run.pending.len() >= run.chunk_size {
            if let Err(e) = run.flush().await {
                return Err(run.fail(e));
            }
        }
    }

    if let Err(e) = run.flush().await {
        return Err(run.fail(e));
    }

    let mut vanished: Vec<String> = existing
        .into_keys()
        .filter(|path| !seen.contains(path))
        .collect();
    vanished.sort();

    if seen.is_empty() && !vanished.is_empty() {
        warn!(
            source = %run.source_key,
            stored = vanished.len(),
            "archive contained no matching files; removing every stored document"
        );
    }

    for chunk in vanished.chunks(run.chunk_size) {
        match store.delete_documents(&run.source_key, chunk).await {
            Ok(removed) => run.counts.deleted += removed,
            Err(e) => return Err(run.fail(e)),
        }
    }

    info!(source = %run.source_key, counts = %run.counts, "reconciled");
    Ok(run.counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello!"));
    }

    #[test]
    fn build_document_parses_front_matter() {
        let doc = build_document(
            "acme/docs",
            "docs/state.md",
            "---\ntitle: $state\n---\n\nbody".to_string(),
            42,
        );
        assert_eq!(doc.title, "$state");
        assert_eq!(doc.metadata()["title"], "$state");
        assert_eq!(doc.size, doc.content.len() as i64);
        assert_eq!(doc.content_hash, content_hash(&doc.content));
        assert_eq!(doc.last_synced_at, 42);
    }
}
