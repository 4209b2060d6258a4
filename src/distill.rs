//! Distillation orchestrator.
//!
//! Runs one preset through a [`BatchProvider`]:
//!
//! ```text
//! materialize ─▶ drop short docs ─▶ job(pending) ─▶ submit ─▶ job(processing)
//!      ─▶ poll until ended ─▶ fetch outcomes ─▶ record results
//!      ─▶ build one artifact per grouping (latest + dated) ─▶ job(completed)
//! ```
//!
//! Per-document failures are recorded as unsuccessful results and never fail
//! the job. Any infrastructure error after the job row exists (submission,
//! exhausted status retries, result retrieval, store writes) moves the job to
//! `failed` with the error message and is returned to the caller.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::DistillationConfig;
use crate::error::{PipelineError, Result};
use crate::models::{DistillationJob, DistillationResult, DistilledArtifact, VersionTag};
use crate::preset::{materialize, BundleEntry, MaterializedBundle, PresetDefinition};
use crate::provider::{
    BatchHandle, BatchProvider, BatchRequest, BatchState, BatchStatus, ModelParams, Outcome,
};
use crate::store::SqliteStore;

/// Polling and status-retry timings.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
    pub status_retries: u32,
    pub retry_delay: Duration,
}

impl From<&DistillationConfig> for PollPolicy {
    fn from(config: &DistillationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
            status_retries: config.status_retries,
            retry_delay: Duration::from_secs(config.status_retry_delay_secs),
        }
    }
}

/// Positional request id. Provider ids are restricted to
/// `[A-Za-z0-9_-]{1,64}`, so paths cannot be used directly.
pub fn request_id(index: usize) -> String {
    format!("doc-{:05}", index)
}

pub struct Orchestrator<'a> {
    store: &'a SqliteStore,
    provider: &'a dyn BatchProvider,
    prompt: String,
    params: ModelParams,
    min_length: usize,
    poll: PollPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a SqliteStore,
        provider: &'a dyn BatchProvider,
        config: &DistillationConfig,
    ) -> Self {
        Self {
            store,
            provider,
            prompt: config.prompt.clone(),
            params: ModelParams {
                model: config.model.clone(),
                max_tokens: config.max_tokens,
            },
            min_length: config.min_length,
            poll: PollPolicy::from(config),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Distill `definition` and return the finished job.
    ///
    /// Errors raised before a job row exists (unknown source, empty preset)
    /// leave no job behind.
    pub async fn run(
        &self,
        preset_key: &str,
        definition: &PresetDefinition,
        now: DateTime<Utc>,
    ) -> Result<DistillationJob> {
        let bundle = materialize(self.store, definition)
            .await?
            .require_content(preset_key)?;

        let total = bundle.len();
        let docs: Vec<BundleEntry> = bundle
            .entries
            .into_iter()
            .filter(|e| e.content.chars().count() >= self.min_length)
            .collect();
        if docs.len() < total {
            info!(
                preset = preset_key,
                skipped = total - docs.len(),
                min_length = self.min_length,
                "skipping documents too short to distill"
            );
        }
        if docs.is_empty() {
            return Err(PipelineError::NoContentForPreset(preset_key.to_string()));
        }

        let job = self
            .store
            .create_job(preset_key, docs.len() as i64, now.timestamp())
            .await?;
        info!(job_id = job.id, preset = preset_key, documents = docs.len(), "distillation job created");

        match self.drive(job.id, definition, &docs, now).await {
            Ok(()) => self
                .store
                .get_job(job.id)
                .await?
                .ok_or(PipelineError::StoreUnavailable(sqlx::Error::RowNotFound)),
            Err(e) => {
                error!(job_id = job.id, error = %e, "distillation job failed");
                if let Err(mark) = self
                    .store
                    .fail_job(job.id, &e.to_string(), Utc::now().timestamp())
                    .await
                {
                    error!(job_id = job.id, error = %mark, "could not mark job failed");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job_id: i64,
        definition: &PresetDefinition,
        docs: &[BundleEntry],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let requests: Vec<BatchRequest> = docs
            .iter()
            .enumerate()
            .map(|(i, doc)| BatchRequest {
                id: request_id(i),
                system: self.prompt.clone(),
                content: doc.content.clone(),
                params: self.params.clone(),
            })
            .collect();

        let handle = self.provider.submit_batch(requests).await?;
        self.store
            .mark_job_processing(job_id, handle.as_str())
            .await?;
        info!(job_id, batch = %handle.as_str(), provider = self.provider.name(), "batch submitted");

        let status = self.poll_until_ended(job_id, &handle).await?;
        let results_url = status.results_url.ok_or_else(|| {
            PipelineError::ProviderUnavailable(format!(
                "batch {} ended without a results location",
                handle.as_str()
            ))
        })?;

        let outcomes = self.provider.fetch_results(&results_url).await?;
        let mut by_id: HashMap<String, Outcome> = HashMap::with_capacity(outcomes.len());
        for outcome in outcomes {
            by_id.insert(outcome.id, outcome.outcome);
        }

        let mut successful: Vec<BundleEntry> = Vec::new();
        let mut input_tokens = 0i64;
        let mut output_tokens = 0i64;

        for (i, doc) in docs.iter().enumerate() {
            let result = match by_id.remove(&request_id(i)) {
                Some(Outcome::Succeeded {
                    text,
                    input_tokens: inp,
                    output_tokens: out,
                }) => {
                    input_tokens += inp;
                    output_tokens += out;
                    successful.push(BundleEntry {
                        content: text.trim().to_string(),
                        ..doc.clone()
                    });
                    DistillationResult {
                        job_id,
                        path: doc.path.clone(),
                        original_content: doc.content.clone(),
                        distilled_content: Some(text),
                        success: true,
                        error_message: None,
                        input_tokens: inp,
                        output_tokens: out,
                    }
                }
                Some(Outcome::Failed { message }) => {
                    warn!(job_id, path = %doc.path, error = %message, "document failed");
                    failed_result(job_id, doc, message)
                }
                None => {
                    warn!(job_id, path = %doc.path, "no outcome returned for document");
                    failed_result(job_id, doc, "no result returned by provider".to_string())
                }
            };
            self.store.insert_result(&result).await?;
        }
        if !by_id.is_empty() {
            warn!(job_id, unknown = by_id.len(), "provider returned outcomes for unknown ids");
        }

        self.write_artifacts(job_id, definition, &successful, now)
            .await?;

        self.store
            .complete_job(
                job_id,
                docs.len() as i64,
                successful.len() as i64,
                input_tokens,
                output_tokens,
                Utc::now().timestamp(),
            )
            .await?;

        info!(
            job_id,
            processed = docs.len(),
            successful = successful.len(),
            input_tokens,
            output_tokens,
            "distillation job completed"
        );
        Ok(())
    }

    /// Poll at a fixed interval until the batch ends or `max_wait` runs out.
    async fn poll_until_ended(&self, job_id: i64, handle: &BatchHandle) -> Result<BatchStatus> {
        let started = Instant::now();
        let deadline = started + self.poll.max_wait;

        loop {
            let status = self.status_with_retry(handle).await?;
            self.store
                .update_job_progress(
                    job_id,
                    status.counts.finished() as i64,
                    status.counts.succeeded as i64,
                )
                .await?;

            if status.state == BatchState::Ended {
                return Ok(status);
            }

            if Instant::now() + self.poll.interval > deadline {
                return Err(PipelineError::Timeout {
                    what: format!("batch {}", handle.as_str()),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }

    /// Status call with a bounded, fixed-delay retry on transient failures.
    /// Rejections are not retried.
    async fn status_with_retry(&self, handle: &BatchHandle) -> Result<BatchStatus> {
        let mut attempt = 0;
        loop {
            match self.provider.batch_status(handle).await {
                Ok(status) => return Ok(status),
                Err(PipelineError::ProviderUnavailable(msg)) if attempt < self.poll.status_retries => {
                    attempt += 1;
                    warn!(
                        batch = %handle.as_str(),
                        attempt,
                        error = %msg,
                        "batch status failed, retrying"
                    );
                    tokio::time::sleep(self.poll.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One artifact per grouping, written under `latest` and today's date.
    /// Documents keep their bundle order.
    async fn write_artifacts(
        &self,
        job_id: i64,
        definition: &PresetDefinition,
        successful: &[BundleEntry],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let dated = VersionTag::Dated(now.date_naive());

        for group in &definition.groups {
            let members = MaterializedBundle {
                entries: successful
                    .iter()
                    .filter(|e| group.matches(&e.path))
                    .cloned()
                    .collect(),
            };
            if members.is_empty() {
                warn!(job_id, group = %group.name, "no successful documents for grouping");
                continue;
            }

            let content = members.render(definition);
            for version in [VersionTag::Latest, dated] {
                let artifact = DistilledArtifact {
                    group_name: group.name.clone(),
                    version: version.to_string(),
                    size_kb: size_kb(&content),
                    content: content.clone(),
                    document_count: members.len() as i64,
                    source_job_id: Some(job_id),
                    created_at: now.timestamp(),
                };
                self.store.upsert_artifact(&artifact).await?;
            }
            info!(job_id, group = %group.name, documents = members.len(), "artifact written");
        }
        Ok(())
    }
}

fn failed_result(job_id: i64, doc: &BundleEntry, message: String) -> DistillationResult {
    DistillationResult {
        job_id,
        path: doc.path.clone(),
        original_content: doc.content.clone(),
        distilled_content: None,
        success: false,
        error_message: Some(message),
        input_tokens: 0,
        output_tokens: 0,
    }
}

/// Size in KiB, two decimals.
fn size_kb(content: &str) -> f64 {
    (content.len() as f64 / 1024.0 * 100.0).round() / 100.0
}
