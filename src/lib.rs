//! catmirror - stability-aware, verified directory mirror.
//!
//! Watches source directories for files (and `.d` bundle directories) that
//! have finished being produced by an external writer, copies them to one or
//! more destination roots preserving relative layout, and verifies every
//! copy against the original before atomically publishing it at its final
//! name. A SQLite metadata store survives restarts so already-mirrored items
//! are never recopied and partial work resumes safely.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                MIRROR WORKERS (one per source set)           │
//! │  tick: free-space gate → inventory → stability → publish     │
//! └──────────┬─────────────────────────┬─────────────────────────┘
//!            │ candidates              │ copy / verify / rename
//! ┌──────────┴──────────┐   ┌──────────┴─────────────────────────┐
//! │   PATH INVENTORY    │   │        PUBLISH PIPELINE            │
//! │  files + .d bundles │   │  stage (.cat.part) → re-hash both  │
//! └─────────────────────┘   │  endpoints → atomic rename         │
//!                           └──────────┬─────────────────────────┘
//!                                      │ one transaction
//! ┌────────────────────────────────────┴─────────────────────────┐
//! │                    METADATA STORE (SQLite)                   │
//! │  observed sizes for stability · published rows for           │
//! │  idempotency across restarts                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key properties
//!
//! - **Never partial**: a destination path only ever appears under its final
//!   name after a verified, atomic rename from staging.
//! - **Idempotent**: rerunning over an unchanged tree copies zero bytes.
//! - **Crash-safe**: stale staging files are cleared and interrupted copies
//!   restart from zero on the next stable tick.

/// Configuration document and duration parsing.
pub mod config;

/// SHA-256 digests for files and bundle directories.
pub mod hash;

/// Candidate enumeration under a source root.
pub mod inventory;

/// Optional Slack notification sink.
pub mod notify;

/// Copy, verify, and atomic-publish pipeline.
pub mod pipeline;

/// Destination free-space queries.
pub mod space;

/// Size-stability detection.
pub mod stability;

/// Persistent metadata store.
pub mod store;

/// Per-source-set mirror workers.
pub mod worker;

pub use config::{MirrorConfig, MirrorSettings};
pub use inventory::Candidate;
pub use notify::Notifier;
pub use pipeline::{PublishOutcome, PublishPolicy};
pub use store::MetadataStore;
pub use worker::{EngineContext, MirrorWorker};
