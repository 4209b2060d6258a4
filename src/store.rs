//! SQLite document store.
//!
//! Holds the raw corpus (`documents`), per-source sync bookkeeping
//! (`sync_state`), and the distillation tables (`distillation_jobs`,
//! `distillation_results`, `distilled_artifacts`). Every write is an
//! insert-or-update keyed by the table's unique constraint, so concurrent
//! pipeline runs over different sources never clobber each other.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::error::{PipelineError, Result};
use crate::migrate;
use crate::models::{
    DistillationJob, DistillationResult, DistilledArtifact, Document, JobStatus, ReconcileCounts,
    SyncState, VersionTag,
};

const DOCUMENT_COLUMNS: &str =
    "source, path, title, content, size, content_hash, metadata_json, last_synced_at";

const JOB_COLUMNS: &str = "id, preset, status, total_files, processed_files, successful_files, \
     total_input_tokens, total_output_tokens, batch_handle, started_at, completed_at, error_message";

const ARTIFACT_COLUMNS: &str =
    "group_name, version, content, size_kb, document_count, source_job_id, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database file and apply migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Documents ============

    pub async fn get_document(&self, source: &str, path: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE source = ? AND path = ?",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(source)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(document_from_row))
    }

    /// Every stored document of `source`, ordered by path.
    pub async fn list_documents(&self, source: &str) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE source = ? ORDER BY path",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    /// `path → content_hash` for every stored document of `source`.
    pub async fn document_hashes(&self, source: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT path, content_hash FROM documents WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("path"), row.get("content_hash")))
            .collect())
    }

    pub async fn count_documents(&self, source: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert or update a batch of documents in one transaction.
    pub async fn upsert_documents(&self, docs: &[Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            sqlx::query(
                r#"
                INSERT INTO documents (source, path, title, content, size, content_hash, metadata_json, last_synced_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source, path) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    size = excluded.size,
                    content_hash = excluded.content_hash,
                    metadata_json = excluded.metadata_json,
                    last_synced_at = excluded.last_synced_at
                "#,
            )
            .bind(&doc.source)
            .bind(&doc.path)
            .bind(&doc.title)
            .bind(&doc.content)
            .bind(doc.size)
            .bind(&doc.content_hash)
            .bind(&doc.metadata_json)
            .bind(doc.last_synced_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a batch of paths of `source` in one transaction. Returns the
    /// number of rows removed.
    pub async fn delete_documents(&self, source: &str, paths: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for path in paths {
            removed += sqlx::query("DELETE FROM documents WHERE source = ? AND path = ?")
                .bind(source)
                .bind(path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Best single match for `query`: exact title (case-insensitive), then
    /// partial title, then path substring. Ties go to the smaller path.
    pub async fn search(&self, query: &str, source: Option<&str>) -> Result<Option<Document>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            r#"
            SELECT {} FROM documents
            WHERE (?1 IS NULL OR source = ?1)
              AND (lower(title) = lower(?2)
                   OR instr(lower(title), lower(?2)) > 0
                   OR instr(lower(path), lower(?2)) > 0)
            ORDER BY
                CASE
                    WHEN lower(title) = lower(?2) THEN 0
                    WHEN instr(lower(title), lower(?2)) > 0 THEN 1
                    ELSE 2
                END,
                path
            LIMIT 1
            "#,
            DOCUMENT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(source)
            .bind(query)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(document_from_row))
    }

    // ============ Sync state ============

    pub async fn record_sync(
        &self,
        source: &str,
        counts: &ReconcileCounts,
        synced_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (source, synced_at, upserted, deleted, unchanged)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                synced_at = excluded.synced_at,
                upserted = excluded.upserted,
                deleted = excluded.deleted,
                unchanged = excluded.unchanged
            "#,
        )
        .bind(source)
        .bind(synced_at)
        .bind(counts.upserted as i64)
        .bind(counts.deleted as i64)
        .bind(counts.unchanged as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sync_state(&self, source: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT source, synced_at, upserted, deleted, unchanged FROM sync_state WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SyncState {
            source: row.get("source"),
            synced_at: row.get("synced_at"),
            counts: ReconcileCounts {
                upserted: row.get::<i64, _>("upserted") as u64,
                deleted: row.get::<i64, _>("deleted") as u64,
                unchanged: row.get::<i64, _>("unchanged") as u64,
            },
        }))
    }

    // ============ Distillation jobs ============

    /// Create a job in `pending`.
    pub async fn create_job(
        &self,
        preset: &str,
        total_files: i64,
        started_at: i64,
    ) -> Result<DistillationJob> {
        let id = sqlx::query(
            "INSERT INTO distillation_jobs (preset, status, total_files, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(preset)
        .bind(JobStatus::Pending.as_str())
        .bind(total_files)
        .bind(started_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.require_job(id).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<DistillationJob>> {
        let sql = format!("SELECT {} FROM distillation_jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn require_job(&self, id: i64) -> Result<DistillationJob> {
        self.get_job(id)
            .await?
            .ok_or(PipelineError::StoreUnavailable(sqlx::Error::RowNotFound))
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<DistillationJob>> {
        let sql = format!(
            "SELECT {} FROM distillation_jobs ORDER BY id DESC LIMIT ?",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// `pending → processing`, recording the provider's batch handle.
    pub async fn mark_job_processing(&self, id: i64, batch_handle: &str) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE distillation_jobs SET status = ?, batch_handle = ? WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Processing.as_str())
        .bind(batch_handle)
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        expect_transition(affected, id, JobStatus::Processing)
    }

    /// Progress counters while `processing`. Counts are clamped so that
    /// `successful ≤ processed ≤ total` always holds.
    pub async fn update_job_progress(&self, id: i64, processed: i64, successful: i64) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE distillation_jobs
            SET processed_files = MIN(?1, total_files),
                successful_files = MIN(?2, ?1, total_files)
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(processed)
        .bind(successful)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        expect_transition(affected, id, JobStatus::Processing)
    }

    /// `processing → completed` with final counts.
    pub async fn complete_job(
        &self,
        id: i64,
        processed: i64,
        successful: i64,
        input_tokens: i64,
        output_tokens: i64,
        completed_at: i64,
    ) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE distillation_jobs
            SET status = ?1,
                processed_files = MIN(?2, total_files),
                successful_files = MIN(?3, ?2, total_files),
                total_input_tokens = ?4,
                total_output_tokens = ?5,
                completed_at = ?6
            WHERE id = ?7 AND status = ?8
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(processed)
        .bind(successful)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(completed_at)
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        expect_transition(affected, id, JobStatus::Completed)
    }

    /// `pending | processing → failed`.
    pub async fn fail_job(&self, id: i64, message: &str, completed_at: i64) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE distillation_jobs
            SET status = ?1, error_message = ?2, completed_at = ?3
            WHERE id = ?4 AND status IN (?5, ?6)
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(message)
        .bind(completed_at)
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        expect_transition(affected, id, JobStatus::Failed)
    }

    // ============ Distillation results ============

    pub async fn insert_result(&self, result: &DistillationResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO distillation_results
                (job_id, path, original_content, distilled_content, success, error_message, input_tokens, output_tokens)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.job_id)
        .bind(&result.path)
        .bind(&result.original_content)
        .bind(&result.distilled_content)
        .bind(result.success)
        .bind(&result.error_message)
        .bind(result.input_tokens)
        .bind(result.output_tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_results(&self, job_id: i64) -> Result<Vec<DistillationResult>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, path, original_content, distilled_content, success, error_message, input_tokens, output_tokens
            FROM distillation_results WHERE job_id = ? ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DistillationResult {
                job_id: row.get("job_id"),
                path: row.get("path"),
                original_content: row.get("original_content"),
                distilled_content: row.get("distilled_content"),
                success: row.get("success"),
                error_message: row.get("error_message"),
                input_tokens: row.get("input_tokens"),
                output_tokens: row.get("output_tokens"),
            })
            .collect())
    }

    // ============ Distilled artifacts ============

    pub async fn upsert_artifact(&self, artifact: &DistilledArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO distilled_artifacts (group_name, version, content, size_kb, document_count, source_job_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_name, version) DO UPDATE SET
                content = excluded.content,
                size_kb = excluded.size_kb,
                document_count = excluded.document_count,
                source_job_id = excluded.source_job_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&artifact.group_name)
        .bind(&artifact.version)
        .bind(&artifact.content)
        .bind(artifact.size_kb)
        .bind(artifact.document_count)
        .bind(artifact.source_job_id)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_artifact(
        &self,
        group_name: &str,
        version: &VersionTag,
    ) -> Result<Option<DistilledArtifact>> {
        let sql = format!(
            "SELECT {} FROM distilled_artifacts WHERE group_name = ? AND version = ?",
            ARTIFACT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(group_name)
            .bind(version.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(artifact_from_row))
    }

    /// Version history of a grouping: `latest` first, then dated versions
    /// newest first.
    pub async fn list_artifact_versions(&self, group_name: &str) -> Result<Vec<DistilledArtifact>> {
        let sql = format!(
            r#"
            SELECT {} FROM distilled_artifacts WHERE group_name = ?
            ORDER BY CASE WHEN version = 'latest' THEN 0 ELSE 1 END, version DESC
            "#,
            ARTIFACT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(group_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(artifact_from_row).collect())
    }
}

fn expect_transition(affected: u64, job_id: i64, to: JobStatus) -> Result<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(PipelineError::InvalidJobTransition { job_id, to })
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        source: row.get("source"),
        path: row.get("path"),
        title: row.get("title"),
        content: row.get("content"),
        size: row.get("size"),
        content_hash: row.get("content_hash"),
        metadata_json: row.get("metadata_json"),
        last_synced_at: row.get("last_synced_at"),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<DistillationJob> {
    let status: String = row.get("status");
    let status = JobStatus::parse(&status).ok_or_else(|| {
        PipelineError::StoreUnavailable(sqlx::Error::Decode(
            format!("unknown job status '{}'", status).into(),
        ))
    })?;

    Ok(DistillationJob {
        id: row.get("id"),
        preset: row.get("preset"),
        status,
        total_files: row.get("total_files"),
        processed_files: row.get("processed_files"),
        successful_files: row.get("successful_files"),
        total_input_tokens: row.get("total_input_tokens"),
        total_output_tokens: row.get("total_output_tokens"),
        batch_handle: row.get("batch_handle"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
    })
}

fn artifact_from_row(row: &SqliteRow) -> DistilledArtifact {
    DistilledArtifact {
        group_name: row.get("group_name"),
        version: row.get("version"),
        content: row.get("content"),
        size_kb: row.get("size_kb"),
        document_count: row.get("document_count"),
        source_job_id: row.get("source_job_id"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("store.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn doc(path: &str, title: &str, content: &str) -> Document {
        Document {
            source: "acme/docs".to_string(),
            path: path.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            size: content.len() as i64,
            content_hash: format!("hash-{}", content),
            metadata_json: "{}".to_string(),
            last_synced_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_source_and_path() {
        let (_tmp, store) = temp_store().await;
        store.upsert_documents(&[doc("a.md", "A", "one")]).await.unwrap();
        store.upsert_documents(&[doc("a.md", "A", "two")]).await.unwrap();

        assert_eq!(store.count_documents("acme/docs").await.unwrap(), 1);
        let stored = store.get_document("acme/docs", "a.md").await.unwrap().unwrap();
        assert_eq!(stored.content, "two");
        assert!(store.get_document("other/repo", "a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_rows_removed() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_documents(&[doc("a.md", "A", "1"), doc("b.md", "B", "2")])
            .await
            .unwrap();
        let removed = store
            .delete_documents("acme/docs", &["b.md".to_string(), "missing.md".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let hashes = store.document_hashes("acme/docs").await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes["a.md"], "hash-1");
    }

    #[tokio::test]
    async fn search_precedence() {
        let (_tmp, store) = temp_store().await;
        store
            .upsert_documents(&[
                doc("docs/state.md", "$state", "x"),
                doc("docs/derived.md", "$state and $derived", "x"),
                doc("docs/01-state-basics.md", "Basics", "x"),
            ])
            .await
            .unwrap();

        let exact = store.search("$STATE", None).await.unwrap().unwrap();
        assert_eq!(exact.path, "docs/state.md");

        let partial = store.search("derived", None).await.unwrap().unwrap();
        assert_eq!(partial.path, "docs/derived.md");

        let by_path = store.search("state-basics", None).await.unwrap().unwrap();
        assert_eq!(by_path.path, "docs/01-state-basics.md");

        assert!(store.search("nothing-like-this", None).await.unwrap().is_none());
        assert!(store.search("   ", None).await.unwrap().is_none());
        assert!(store.search("$state", Some("other/repo")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_transitions_are_monotonic() {
        let (_tmp, store) = temp_store().await;
        let job = store.create_job("svelte", 5, 100).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        // progress is only legal while processing
        assert!(store.update_job_progress(job.id, 1, 1).await.is_err());

        store.mark_job_processing(job.id, "msgbatch_1").await.unwrap();
        store.update_job_progress(job.id, 9, 9).await.unwrap();
        let mid = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(mid.processed_files, 5);
        assert_eq!(mid.successful_files, 5);

        store.complete_job(job.id, 5, 3, 1000, 200, 200).await.unwrap();
        let done = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.successful_files, 3);
        assert_eq!(done.batch_handle.as_deref(), Some("msgbatch_1"));

        let err = store.fail_job(job.id, "late", 300).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJobTransition { .. }));
        let err = store.mark_job_processing(job.id, "again").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJobTransition { .. }));
    }

    #[tokio::test]
    async fn artifact_versions() {
        let (_tmp, store) = temp_store().await;
        for version in ["latest", "2025-01-01", "2025-02-01"] {
            store
                .upsert_artifact(&DistilledArtifact {
                    group_name: "all".to_string(),
                    version: version.to_string(),
                    content: format!("body {}", version),
                    size_kb: 1.0,
                    document_count: 2,
                    source_job_id: None,
                    created_at: 0,
                })
                .await
                .unwrap();
        }

        let latest = store
            .get_artifact("all", &VersionTag::Latest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.content, "body latest");

        let versions: Vec<String> = store
            .list_artifact_versions("all")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.version)
            .collect();
        assert_eq!(versions, vec!["latest", "2025-02-01", "2025-01-01"]);
    }
}
