//! Tarball ingestion from the repository host.
//!
//! The archive is streamed: the HTTP body is bridged into a blocking reader,
//! gunzipped and walked entry by entry on a blocking task, and each matching
//! file is handed to the caller through a small bounded channel. Nothing but
//! the current entry (plus the channel buffer) is held in memory.
//!
//! The stream is single-pass. A failure means calling [`ingest`] again.
//!
//! # Path normalization
//!
//! GitHub tarballs wrap everything in a synthetic `{owner}-{repo}-{sha}/`
//! directory. It is stripped, so `sveltejs-svelte-1a2b3c/docs/intro.md`
//! becomes `docs/intro.md`.

use std::io::Read;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::{Stream, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

use crate::config::GithubConfig;
use crate::error::{PipelineError, Result};
use crate::models::Source;

/// Entries buffered between the extraction task and the consumer.
const ENTRY_BUFFER: usize = 16;

/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_PREALLOC: u64 = 128 * 1024;

/// Compressed archive bytes as they arrive from the host.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One file extracted from the archive, path already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Where archives come from.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Start downloading the archive for `source`. Fails with
    /// [`PipelineError::SourceUnavailable`] if the host cannot be reached or
    /// answers with a non-success status.
    async fn fetch_archive(&self, source: &Source) -> Result<ByteStream>;
}

// ============ GitHub ============

/// Fetches `GET /repos/{owner}/{repo}/tarball/{ref}` from the GitHub API.
pub struct GithubHost {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubHost {
    /// Build a host client. The bearer token is read from the environment
    /// variable named by `token_env`; without it requests are anonymous.
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("llmdocs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: std::env::var(&config.token_env).ok(),
        })
    }

    fn tarball_url(&self, source: &Source) -> String {
        format!(
            "{}/repos/{}/{}/tarball/{}",
            self.api_url, source.owner, source.repo, source.git_ref
        )
    }
}

#[async_trait]
impl RepoHost for GithubHost {
    async fn fetch_archive(&self, source: &Source) -> Result<ByteStream> {
        let url = self.tarball_url(source);
        debug!(%url, "requesting tarball");

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", source, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::SourceUnavailable(format!(
                "{}: HTTP {}: {}",
                source,
                status,
                body.trim()
            )));
        }

        let stream = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }
}

// ============ Matching ============

/// Include/exclude glob filter applied to normalized entry paths.
#[derive(Debug, Clone)]
pub struct Matcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl Matcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ============ Extraction ============

/// Remove the archive's synthetic top-level directory. Returns `None` for the
/// top-level directory itself.
pub fn strip_top_level(raw: &str) -> Option<String> {
    let raw = raw.trim_start_matches("./");
    let (_, rest) = raw.split_once('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

fn corrupt(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::ArchiveCorrupt(e.to_string())
}

/// Walk a gzipped tar stream, calling `emit` for every regular file whose
/// normalized path passes `matcher`. Stops early when `emit` returns `false`.
pub fn read_archive<R, F>(reader: R, matcher: &Matcher, mut emit: F) -> Result<()>
where
    R: Read,
    F: FnMut(ArchiveEntry) -> bool,
{
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();
        let Some(path) = strip_top_level(&raw) else {
            continue;
        };
        if !matcher.is_match(&path) {
            continue;
        }

        let declared = entry.size();
        let mut bytes = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);
        entry.read_to_end(&mut bytes).map_err(corrupt)?;
        if bytes.len() as u64 != declared {
            return Err(corrupt(format!(
                "{}: header declares {} bytes, archive holds {}",
                path,
                declared,
                bytes.len()
            )));
        }

        if !emit(ArchiveEntry { path, bytes }) {
            break;
        }
    }

    Ok(())
}

/// Lazily yields the matching entries of one archive.
pub struct ArchiveStream {
    rx: mpsc::Receiver<Result<ArchiveEntry>>,
    task: Option<JoinHandle<()>>,
}

impl ArchiveStream {
    /// Start extracting `bytes` on a blocking task. Must be called from
    /// within a tokio runtime.
    pub fn spawn(bytes: ByteStream, matcher: Matcher) -> Self {
        let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
        let reader = SyncIoBridge::new(StreamReader::new(bytes));

        let task = tokio::task::spawn_blocking(move || {
            let result = read_archive(reader, &matcher, |entry| tx.blocking_send(Ok(entry)).is_ok());
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next matching entry, `None` once the archive is exhausted.
    pub async fn next(&mut self) -> Option<Result<ArchiveEntry>> {
        if let Some(item) = self.rx.recv().await {
            return Some(item);
        }
        let task = self.task.take()?;
        match task.await {
            Ok(()) => None,
            Err(e) => Some(Err(corrupt(format!("extraction task failed: {}", e)))),
        }
    }
}

/// Fetch the archive for `source` and stream out its matching files.
pub async fn ingest(host: &dyn RepoHost, source: &Source, matcher: Matcher) -> Result<ArchiveStream> {
    info!(%source, "fetching archive");
    let bytes = host.fetch_archive(source).await?;
    Ok(ArchiveStream::spawn(bytes, matcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(enc);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder
            .append_data(&mut dir, "acme-docs-abc123/", std::io::empty())
            .unwrap();

        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(
                    &mut header,
                    format!("acme-docs-abc123/{}", path),
                    content.as_bytes(),
                )
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn md_matcher() -> Matcher {
        Matcher::new(&["**/*.md".to_string()], &["**/drafts/**".to_string()]).unwrap()
    }

    #[test]
    fn strips_synthetic_top_level() {
        assert_eq!(
            strip_top_level("acme-docs-abc123/docs/a.md").as_deref(),
            Some("docs/a.md")
        );
        assert_eq!(strip_top_level("acme-docs-abc123/"), None);
        assert_eq!(strip_top_level("pax_global_header"), None);
    }

    #[test]
    fn read_archive_filters_and_normalizes() {
        let data = tarball(&[
            ("docs/a.md", "# A"),
            ("docs/drafts/b.md", "# B"),
            ("src/main.rs", "fn main() {}"),
            ("README.md", "# Readme"),
        ]);
        let mut seen = Vec::new();
        read_archive(&data[..], &md_matcher(), |e| {
            seen.push(e);
            true
        })
        .unwrap();

        let paths: Vec<&str> = seen.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/a.md", "README.md"]);
        assert_eq!(seen[0].bytes, b"# A");
    }

    #[test]
    fn garbage_is_archive_corrupt() {
        let err = read_archive(&b"definitely not gzip"[..], &md_matcher(), |_| true).unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(_)));
    }

    #[test]
    fn truncated_archive_is_archive_corrupt() {
        let data = tarball(&[("docs/a.md", &"x".repeat(10_000))]);
        let truncated = &data[..data.len() / 2];
        let err = read_archive(truncated, &md_matcher(), |_| true).unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(_)));
    }

    #[test]
    fn oversized_header_is_archive_corrupt() {
        let enc = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(1 << 40);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "acme-docs-abc123/docs/huge.md", &b"# tiny"[..])
            .unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let mut emitted = 0;
        let err = read_archive(&data[..], &md_matcher(), |_| {
            emitted += 1;
            true
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(ref m) if m.contains("docs/huge.md")));
        assert_eq!(emitted, 0);
    }

    #[tokio::test]
    async fn archive_stream_yields_entries_from_chunked_body() {
        let data = tarball(&[("docs/a.md", "# A"), ("docs/b.md", "# B")]);
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let bytes: ByteStream = Box::pin(futures::stream::iter(chunks));

        let mut stream = ArchiveStream::spawn(bytes, md_matcher());
        let mut paths = Vec::new();
        while let Some(entry) = stream.next().await {
            paths.push(entry.unwrap().path);
        }
        assert_eq!(paths, vec!["docs/a.md", "docs/b.md"]);
    }
}
