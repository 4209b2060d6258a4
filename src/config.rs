use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::models::Source;
use crate::preset::{DistillGroup, PresetDefinition};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub distillation: DistillationConfig,
    #[serde(default)]
    pub presets: BTreeMap<String, PresetDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default = "default_github_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            token_env: default_github_token_env(),
            timeout_secs: default_github_timeout_secs(),
        }
    }
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_github_timeout_secs() -> u64 {
    300
}

/// Corpus-wide settings. The include filter here is deliberately broad: the
/// store holds every document, presets narrow it later.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default = "default_upsert_chunk_size")]
    pub upsert_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_age_hours: default_max_age_hours(),
            upsert_chunk_size: default_upsert_chunk_size(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.mdx".to_string()]
}
fn default_max_age_hours() -> u64 {
    24
}
fn default_upsert_chunk_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistillationConfig {
    #[serde(default = "default_provider_api_url")]
    pub api_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Documents shorter than this (in characters) are not worth condensing.
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,
    #[serde(default = "default_status_retry_delay_secs")]
    pub status_retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            api_url: default_provider_api_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            min_length: default_min_length(),
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            status_retries: default_status_retries(),
            status_retry_delay_secs: default_status_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
            prompt: default_prompt(),
        }
    }
}

fn default_provider_api_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_max_tokens() -> u32 {
    16_384
}
fn default_min_length() -> usize {
    200
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_max_wait_secs() -> u64 {
    24 * 60 * 60
}
fn default_status_retries() -> u32 {
    3
}
fn default_status_retry_delay_secs() -> u64 {
    5
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_prompt() -> String {
    "You are condensing technical documentation for use as context by a coding assistant. \
Rewrite the document below so it is as short as possible while keeping every API, \
signature, option, rule and code example needed to use it correctly. Drop prose that \
only motivates or repeats. Keep markdown structure. Output only the condensed document."
        .to_string()
}

impl Config {
    /// Look up a configured source by its `owner/repo` key.
    pub fn source(&self, key: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.key() == key)
    }

    /// Give every preset without explicit groupings the default one.
    fn apply_default_groups(&mut self) {
        for (key, preset) in self.presets.iter_mut() {
            if preset.groups.is_empty() {
                preset.groups.push(DistillGroup::whole_preset(key));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.upsert_chunk_size == 0 {
            bail!("pipeline.upsert_chunk_size must be > 0");
        }
        if self.pipeline.include_globs.is_empty() {
            bail!("pipeline.include_globs must not be empty");
        }
        check_globs("pipeline.include_globs", &self.pipeline.include_globs)?;
        check_globs("pipeline.exclude_globs", &self.pipeline.exclude_globs)?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.key()) {
                bail!("source '{}' is configured more than once", source.key());
            }
        }

        let d = &self.distillation;
        if d.poll_interval_secs == 0 {
            bail!("distillation.poll_interval_secs must be > 0");
        }
        if d.poll_interval_secs > d.max_wait_secs {
            bail!("distillation.poll_interval_secs must not exceed distillation.max_wait_secs");
        }
        if d.max_tokens == 0 {
            bail!("distillation.max_tokens must be > 0");
        }

        // artifacts are keyed by grouping name, so names are global
        let mut group_owners: HashMap<&str, &str> = HashMap::new();
        for (key, preset) in &self.presets {
            if self.source(&preset.source).is_none() {
                bail!(
                    "preset '{}' references unknown source '{}'",
                    key,
                    preset.source
                );
            }
            if preset.include.is_empty() {
                bail!("preset '{}' must declare at least one include glob", key);
            }
            check_globs(&format!("presets.{}.include", key), &preset.include)?;
            check_globs(&format!("presets.{}.ignore", key), &preset.ignore)?;

            let mut names = HashSet::new();
            for group in &preset.groups {
                if group.name.trim().is_empty() {
                    bail!("preset '{}' has a distillation group with an empty name", key);
                }
                if !names.insert(group.name.as_str()) {
                    bail!(
                        "preset '{}' declares distillation group '{}' twice",
                        key,
                        group.name
                    );
                }
                if !preset.distill {
                    continue;
                }
                if let Some(other) = group_owners.insert(group.name.as_str(), key.as_str()) {
                    bail!(
                        "distillation group '{}' is declared by both preset '{}' and preset '{}'",
                        group.name,
                        other,
                        key
                    );
                }
            }
        }

        Ok(())
    }
}

fn check_globs(field: &str, patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        Glob::new(pattern).with_context(|| format!("{}: invalid glob '{}'", field, pattern))?;
    }
    Ok(())
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.apply_default_groups();
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
