//! # Shutterflow Core
//!
//! Core library for the Shutterflow archival pipeline: the batch
//! lifecycle orchestrator that moves media from an unsorted source pool
//! into a date-partitioned archive via an external replication service.
//!
//! ## Overview
//!
//! A cycle runs five stages against a durable SQLite catalog:
//!
//! - **Dedup**: hash every newly discovered file, keep the first seen
//!   copy of each digest as `UNIQUE`, mark the rest `DUPLICATE`.
//! - **Batch**: deterministically select unique files under a size or
//!   count budget, stage them into a batch directory and freeze a
//!   manifest.
//! - **Sync**: hand the batch directory to Syncthing, poll folder
//!   completion and fan `SYNCED` out to the member files when the remote
//!   reports 100%.
//! - **Sort**: move synced files into `{year}/{month}/{day}` archive
//!   folders keyed by their capture date.
//! - **Cleanup**: reclaim finished batch directories, stale temp files
//!   and oversized logs.
//!
//! Every state transition is a guarded catalog update, so concurrent
//! callers racing on the same file or batch converge on one winner and
//! one observed no-op, and a crashed run resumes from durable state.
//!
//! ## Architecture
//!
//! - [`catalog`]: SQLite-backed stores for files, batches and the
//!   append-only event log
//! - [`stages`]: the five stage runners
//! - [`pipeline`]: the single-flight orchestrator sequencing them
//! - [`syncthing`]: the replication client and its error taxonomy

#![allow(missing_docs)]

/// EXIF capture timestamp extraction.
pub mod capture;

/// SQLite catalog: schema, status enums and the record stores.
pub mod catalog;

/// Streaming SHA-256 digests.
pub mod digest;

/// Error types shared across the pipeline.
pub mod error;

/// Filesystem moves with cross-device fallback and collision probing.
pub mod fsops;

/// Per-batch manifest artifact.
pub mod manifest;

/// Single-flight orchestrator for full pipeline cycles.
pub mod pipeline;

/// Runtime configuration model.
pub mod settings;

/// Stage runners: dedup, batch, sync, sort, cleanup.
pub mod stages;

/// Syncthing REST client and replication error classification.
pub mod syncthing;

pub use catalog::{BatchRecord, BatchStatus, Catalog, FileRecord, FileStatus};
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineRunner, PipelineStatus, RunReport, StepReport};
pub use settings::Settings;
