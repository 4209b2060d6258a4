//! Core data models shared by the ingester, store, materializer and
//! distillation orchestrator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

/// An (owner, repository) pair identifying one origin of documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub owner: String,
    pub repo: String,
    /// Branch, tag or commit to fetch.
    #[serde(rename = "ref", default = "default_ref")]
    pub git_ref: String,
}

fn default_ref() -> String {
    "main".to_string()
}

impl Source {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: default_ref(),
        }
    }

    /// Store key for this source: `owner/repo`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Parse an `owner/repo` specifier.
    pub fn parse(value: &str) -> Result<Self> {
        match value.split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(Self::new(owner, repo))
            }
            _ => Err(PipelineError::Config(format!(
                "invalid source '{}': expected owner/repo",
                value
            ))),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.git_ref)
    }
}

/// One file's current content. `(source, path)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    /// `owner/repo`.
    pub source: String,
    pub path: String,
    pub title: String,
    pub content: String,
    pub size: i64,
    pub content_hash: String,
    /// Parsed front matter, JSON-encoded.
    pub metadata_json: String,
    pub last_synced_at: i64,
}

impl Document {
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata_json).unwrap_or(serde_json::json!({}))
    }
}

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub upserted: u64,
    pub deleted: u64,
    pub unchanged: u64,
}

impl fmt::Display for ReconcileCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} upserted, {} deleted, {} unchanged",
            self.upserted, self.deleted, self.unchanged
        )
    }
}

/// Last successful reconciliation of a source.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub source: String,
    pub synced_at: i64,
    pub counts: ReconcileCounts,
}

// ============ Distillation ============

/// Lifecycle of a distillation job. Transitions only move forward:
/// `pending → processing → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is allowed. Re-entering the
    /// current non-terminal state is allowed so progress updates are legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, _) => true,
            (JobStatus::Processing, JobStatus::Pending) => false,
            (JobStatus::Processing, _) => true,
            (JobStatus::Completed | JobStatus::Failed, _) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-machine record of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct DistillationJob {
    pub id: i64,
    pub preset: String,
    pub status: JobStatus,
    pub total_files: i64,
    pub processed_files: i64,
    pub successful_files: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub batch_handle: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Per-document outcome within a job. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct DistillationResult {
    pub job_id: i64,
    pub path: String,
    pub original_content: String,
    pub distilled_content: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Either the moving `latest` tag or a calendar-date snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionTag {
    Latest,
    Dated(NaiveDate),
}

impl VersionTag {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "latest" {
            return Ok(VersionTag::Latest);
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(VersionTag::Dated)
            .map_err(|_| PipelineError::InvalidVersionTag(s.to_string()))
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionTag::Latest => f.write_str("latest"),
            VersionTag::Dated(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// A named, versioned derived document. `(group_name, version)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct DistilledArtifact {
    pub group_name: String,
    pub version: String,
    pub content: String,
    pub size_kb: f64,
    pub document_count: i64,
    pub source_job_id: Option<i64>,
    pub created_at: i64,
}
