//! The pipeline service.
//!
//! [`Pipeline`] is constructed once at startup and owns everything the entry
//! points need: the document store, the repository host, the batch provider
//! and the loaded configuration. The CLI (or any scheduler) calls its trigger
//! entry points, [`Pipeline::refresh`] and [`Pipeline::distill`]; readers use
//! the lookup methods. Both triggers are safe to call repeatedly.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use tracing::{info, warn};

use crate::archive::{GithubHost, RepoHost};
use crate::config::Config;
use crate::distill::{Orchestrator, PollPolicy};
use crate::error::{PipelineError, ReconcileError, Result};
use crate::models::{
    DistillationJob, DistilledArtifact, Document, ReconcileCounts, Source, VersionTag,
};
use crate::preset::{materialize, PresetDefinition};
use crate::provider::{AnthropicBatchProvider, BatchProvider};
use crate::reconcile::reconcile;
use crate::staleness::StalenessPolicy;
use crate::store::SqliteStore;

/// What happened to one source during a refresh.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Synced recently enough; nothing fetched.
    Fresh,
    Reconciled(ReconcileCounts),
    Failed(ReconcileError),
}

#[derive(Debug)]
pub struct SourceSync {
    pub source: String,
    pub outcome: SyncOutcome,
}

/// A materialized non-distilled preset, or why it could not be built.
#[derive(Debug)]
pub struct PresetReport {
    pub preset: String,
    pub result: Result<PresetSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSummary {
    pub documents: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub sources: Vec<SourceSync>,
    pub presets: Vec<PresetReport>,
}

impl RefreshReport {
    pub fn has_failures(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.outcome, SyncOutcome::Failed(_)))
            || self.presets.iter().any(|p| p.result.is_err())
    }
}

/// A configured source as seen by operators.
#[derive(Debug, Clone)]
pub struct SourceOverview {
    pub source: Source,
    pub documents: i64,
    pub last_synced: Option<DateTime<Utc>>,
    pub stale: bool,
}

pub struct Pipeline {
    config: Config,
    store: SqliteStore,
    host: Arc<dyn RepoHost>,
    provider: Arc<dyn BatchProvider>,
    staleness: StalenessPolicy,
    poll: PollPolicy,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: SqliteStore,
        host: Arc<dyn RepoHost>,
        provider: Arc<dyn BatchProvider>,
    ) -> Self {
        let staleness = StalenessPolicy::from_hours(config.pipeline.max_age_hours);
        let poll = PollPolicy::from(&config.distillation);
        Self {
            config,
            store,
            host,
            provider,
            staleness,
            poll,
        }
    }

    /// Open the configured database and build the production GitHub host
    /// and Anthropic provider.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.db.path).await?;
        let host = Arc::new(GithubHost::new(&config.github)?);
        let provider = Arc::new(AnthropicBatchProvider::new(&config.distillation)?);
        Ok(Self::new(config, store, host, provider))
    }

    /// Override polling timings (mostly useful in tests).
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn preset(&self, key: &str) -> Result<&PresetDefinition> {
        self.config
            .presets
            .get(key)
            .ok_or_else(|| PipelineError::PresetNotFound(key.to_string()))
    }

    fn configured_source(&self, key: &str) -> Result<&Source> {
        let wanted = Source::parse(key)?;
        self.config
            .source(&wanted.key())
            .ok_or_else(|| PipelineError::Config(format!("source '{}' is not configured", key)))
    }

    async fn last_synced(&self, source: &Source) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .sync_state(&source.key())
            .await?
            .and_then(|s| Utc.timestamp_opt(s.synced_at, 0).single()))
    }

    // ============ Triggers ============

    /// Reconcile one source if stale (or unconditionally with `force`) and
    /// record the sync on success.
    pub async fn sync_source(&self, source: &Source, force: bool, now: DateTime<Utc>) -> SourceSync {
        let key = source.key();

        if !force {
            match self.last_synced(source).await {
                Ok(last) if !self.staleness.is_stale(last, now) => {
                    info!(source = %key, "source is fresh, skipping");
                    return SourceSync {
                        source: key,
                        outcome: SyncOutcome::Fresh,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return SourceSync {
                        outcome: SyncOutcome::Failed(ReconcileError {
                            source_key: key.clone(),
                            counts: ReconcileCounts::default(),
                            error: e,
                        }),
                        source: key,
                    }
                }
            }
        }

        info!(source = %source, "reconciling");
        let outcome = match reconcile(
            &self.store,
            self.host.as_ref(),
            source,
            &self.config.pipeline,
            now.timestamp(),
        )
        .await
        {
            Ok(counts) => match self.store.record_sync(&key, &counts, now.timestamp()).await {
                Ok(()) => SyncOutcome::Reconciled(counts),
                Err(e) => SyncOutcome::Failed(ReconcileError {
                    source_key: key.clone(),
                    counts,
                    error: e,
                }),
            },
            Err(e) => {
                warn!(source = %key, error = %e, "reconciliation failed");
                SyncOutcome::Failed(e)
            }
        };

        SourceSync {
            source: key,
            outcome,
        }
    }

    /// Sync one configured source by `owner/repo` key.
    pub async fn sync(&self, source_key: &str, force: bool, now: DateTime<Utc>) -> Result<SourceSync> {
        let source = self.configured_source(source_key)?;
        Ok(self.sync_source(source, force, now).await)
    }

    /// Reconcile every stale source concurrently, then materialize every
    /// non-distilled preset. Per-source and per-preset failures are reported,
    /// not raised.
    pub async fn refresh(&self, now: DateTime<Utc>) -> RefreshReport {
        let sources = join_all(
            self.config
                .sources
                .iter()
                .map(|source| self.sync_source(source, false, now)),
        )
        .await;

        let mut presets = Vec::new();
        for (key, definition) in &self.config.presets {
            if definition.distill {
                continue;
            }
            let result = self.materialized_summary(key, definition).await;
            if let Err(e) = &result {
                warn!(preset = %key, error = %e, "preset could not be materialized");
            }
            presets.push(PresetReport {
                preset: key.clone(),
                result,
            });
        }

        RefreshReport { sources, presets }
    }

    async fn materialized_summary(
        &self,
        key: &str,
        definition: &PresetDefinition,
    ) -> Result<PresetSummary> {
        let bundle = materialize(&self.store, definition)
            .await?
            .require_content(key)?;
        let text = bundle.render(definition);
        info!(preset = %key, documents = bundle.len(), bytes = text.len(), "materialized");
        Ok(PresetSummary {
            documents: bundle.len(),
            bytes: text.len(),
        })
    }

    /// Run distillation for a `distill = true` preset. Any other key is
    /// reported as [`PipelineError::PresetNotFound`].
    pub async fn distill(&self, preset_key: &str, now: DateTime<Utc>) -> Result<DistillationJob> {
        let definition = match self.config.presets.get(preset_key) {
            Some(def) if def.distill => def,
            _ => return Err(PipelineError::PresetNotFound(preset_key.to_string())),
        };

        Orchestrator::new(&self.store, self.provider.as_ref(), &self.config.distillation)
            .with_poll_policy(self.poll)
            .run(preset_key, definition, now)
            .await
    }

    // ============ Reads ============

    /// Render a preset to text. Never returns partial output.
    pub async fn get_materialized(&self, preset_key: &str) -> Result<String> {
        let definition = self.preset(preset_key)?;
        let bundle = materialize(&self.store, definition)
            .await?
            .require_content(preset_key)?;
        Ok(bundle.render(definition))
    }

    /// `version` is `latest` or `YYYY-MM-DD`.
    pub async fn get_distilled(
        &self,
        group_name: &str,
        version: &str,
    ) -> Result<Option<DistilledArtifact>> {
        let tag = VersionTag::parse(version)?;
        self.store.get_artifact(group_name, &tag).await
    }

    pub async fn list_distilled_versions(&self, group_name: &str) -> Result<Vec<DistilledArtifact>> {
        self.store.list_artifact_versions(group_name).await
    }

    pub async fn get_document(&self, source: &str, path: &str) -> Result<Option<Document>> {
        self.store.get_document(source, path).await
    }

    pub async fn search(&self, query: &str) -> Result<Option<Document>> {
        self.store.search(query, None).await
    }

    pub async fn jobs(&self, limit: i64) -> Result<Vec<DistillationJob>> {
        self.store.list_jobs(limit).await
    }

    pub async fn sources(&self, now: DateTime<Utc>) -> Result<Vec<SourceOverview>> {
        let mut out = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let last_synced = self.last_synced(source).await?;
            out.push(SourceOverview {
                documents: self.store.count_documents(&source.key()).await?,
                stale: self.staleness.is_stale(last_synced, now),
                last_synced,
                source: source.clone(),
            });
        }
        Ok(out)
    }
}
