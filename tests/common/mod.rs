//! Shared fixtures: gzipped tarballs built in memory, a scripted repository
//! host and a scripted batch provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use llmdocs::archive::{ByteStream, RepoHost};
use llmdocs::config::{parse_config, Config};
use llmdocs::error::{PipelineError, Result};
use llmdocs::models::Source;
use llmdocs::provider::{
    BatchCounts, BatchHandle, BatchOutcome, BatchProvider, BatchRequest, BatchState, BatchStatus,
    Outcome,
};
use llmdocs::store::SqliteStore;

/// A GitHub-style tarball: every file under a synthetic top-level directory.
pub fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(enc);

    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(
                &mut header,
                format!("acme-docs-0f1e2d3/{}", path),
                content.as_bytes(),
            )
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub async fn temp_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("llmdocs.sqlite"))
        .await
        .unwrap();
    (tmp, store)
}

/// Serves whatever tarball was last set for a source key.
#[derive(Default)]
pub struct FakeHost {
    pub archives: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
}

impl FakeHost {
    pub fn set_files(&self, source_key: &str, files: &[(&str, &str)]) {
        self.set_raw(source_key, tarball(files));
    }

    pub fn set_raw(&self, source_key: &str, bytes: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert(source_key.to_string(), bytes);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoHost for FakeHost {
    async fn fetch_archive(&self, source: &Source) -> Result<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .archives
            .lock()
            .unwrap()
            .get(&source.key())
            .cloned()
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("{}: HTTP 404", source)))?;

        // Deliver in small chunks, the way a network body arrives.
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(128)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Condenses every document to its first line, failing any document whose
/// content contains `FAIL`. Reports `in_progress` for `polls_before_end`
/// status calls, finishing one request per call, and fails the first
/// `status_failures` of them transiently.
#[derive(Default)]
pub struct FakeProvider {
    pub polls_before_end: usize,
    pub status_failures: usize,
    pub never_ends: bool,
    pub reject_submission: bool,
    pub submitted: Mutex<Vec<BatchRequest>>,
    pub status_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn submitted(&self) -> Vec<BatchRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn tally(requests: &[BatchRequest]) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for r in requests {
            match Self::outcome(r) {
                Outcome::Succeeded { .. } => counts.succeeded += 1,
                Outcome::Failed { .. } => counts.errored += 1,
            }
        }
        counts
    }

    fn outcome(request: &BatchRequest) -> Outcome {
        if request.content.contains("FAIL") {
            Outcome::Failed {
                message: "overloaded_error: simulated".to_string(),
            }
        } else {
            Outcome::Succeeded {
                text: format!("condensed: {}", request.content.lines().next().unwrap_or("")),
                input_tokens: request.content.len() as i64,
                output_tokens: 10,
            }
        }
    }
}

#[async_trait]
impl BatchProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn submit_batch(&self, requests: Vec<BatchRequest>) -> Result<BatchHandle> {
        if self.reject_submission {
            return Err(PipelineError::ProviderRejected(
                "batch submission: HTTP 400: invalid model".to_string(),
            ));
        }
        *self.submitted.lock().unwrap() = requests;
        Ok(BatchHandle("msgbatch_fake".to_string()))
    }

    async fn batch_status(&self, _handle: &BatchHandle) -> Result<BatchStatus> {
        let call = self.status_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.status_failures {
            return Err(PipelineError::ProviderUnavailable(
                "batch status: HTTP 529".to_string(),
            ));
        }

        let requests = self.submitted.lock().unwrap();
        let polls = call - self.status_failures;
        if self.never_ends || polls < self.polls_before_end {
            // one more request finishes per poll, the last one never does
            let done = polls.min(requests.len().saturating_sub(1));
            let mut counts = Self::tally(&requests[..done]);
            counts.processing = (requests.len() - done) as u64;
            return Ok(BatchStatus {
                state: BatchState::InProgress,
                counts,
                results_url: None,
            });
        }

        let counts = Self::tally(&requests);
        Ok(BatchStatus {
            state: BatchState::Ended,
            counts,
            results_url: Some("fake://msgbatch_fake/results".to_string()),
        })
    }

    async fn fetch_results(&self, _results_url: &str) -> Result<Vec<BatchOutcome>> {
        Ok(self
            .submitted
            .lock()
            .unwrap()
            .iter()
            .map(|r| BatchOutcome {
                id: r.id.clone(),
                outcome: Self::outcome(r),
            })
            .collect())
    }
}

pub const CONFIG: &str = r#"
[db]
path = "unused.sqlite"

[pipeline]
include_globs = ["**/*.md"]
upsert_chunk_size = 2

[[sources]]
owner = "acme"
repo = "docs"

[distillation]
min_length = 20
poll_interval_secs = 1
max_wait_secs = 60
status_retries = 2
status_retry_delay_secs = 1

[presets.guide]
source = "acme/docs"
title = "Acme"
include = ["docs/guide/**/*.md", "docs/**/*.md"]
ignore = ["docs/**/99-*.md"]
annotation = "Prefer the documented APIs."

[presets.guide-distilled]
source = "acme/docs"
include = ["docs/**/*.md"]
distill = true

[[presets.guide-distilled.groups]]
name = "acme-full"

[[presets.guide-distilled.groups]]
name = "acme-guide"
prefixes = ["docs/guide/"]
"#;

pub fn config() -> Config {
    parse_config(CONFIG).unwrap()
}
