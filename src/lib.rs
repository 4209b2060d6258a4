//! # llmdocs
//!
//! Ingests documentation trees from GitHub, keeps them as individually
//! addressable documents in SQLite, materializes ordered "preset" bundles
//! from them, and condenses selected presets through a batch inference
//! provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────┐   ┌──────────────┐
//! │ RepoHost   │──▶│ Reconciler │──▶│  SQLite  │──▶│ Materializer │
//! │ (tarball)  │   │ hash diff  │   │  store   │   │   presets    │
//! └────────────┘   └────────────┘   └────┬─────┘   └──────┬───────┘
//!                                        │                │
//!                                        │         ┌──────▼───────┐
//!                                        └─────────│ Orchestrator │◀─▶ BatchProvider
//!                                     artifacts    │ (distill)    │
//!                                                  └──────────────┘
//! ```
//!
//! [`pipeline::Pipeline`] ties the pieces together and is what the CLI
//! drives.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`archive`] | Repository host and streaming tarball ingestion |
//! | [`frontmatter`] | YAML front matter and titles |
//! | [`reconcile`] | Hash-based reconciliation against the store |
//! | [`minimize`] | Content minimization transforms |
//! | [`preset`] | Preset definitions, ordering, materialization |
//! | [`provider`] | Batch inference provider abstraction |
//! | [`distill`] | Distillation orchestrator |
//! | [`staleness`] | Re-ingest policy |
//! | [`store`] | SQLite document and job store |
//! | [`pipeline`] | Service value exposing triggers and reads |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod config;
pub mod db;
pub mod distill;
pub mod error;
pub mod frontmatter;
pub mod migrate;
pub mod minimize;
pub mod models;
pub mod pipeline;
pub mod preset;
pub mod provider;
pub mod reconcile;
pub mod staleness;
pub mod store;

pub use error::{PipelineError, ReconcileError, Result};
