//! diffwatch - Commit Diff Extraction Daemon
//!
//! diffwatch keeps a configured set of git repositories cloned and up to date
//! and writes one structured JSON artifact per commit describing the files,
//! hunks and lines the commit changed.
//!
//! ## Core Features
//!
//! - **Reconciliation**: the tracked set follows a reloadable repository list
//! - **Fault Isolation**: a failing repository is evicted, the cycle goes on
//! - **Incremental Output**: existing `{hash}.json` artifacts are never rewritten
//! - **Patch Parsing**: zero-context `git show` output becomes file/hunk/line records
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and the repository list
//! - [`git`]: Git subprocess execution
//! - [`diff`]: Patch parser and artifact types
//! - [`repository`]: Per-repository clone/sync/log/diff operations
//! - [`controller`]: Reconciliation and the polling loop
//! - [`daemon`]: PID file, signals and background mode

pub mod config;
pub mod controller;
pub mod daemon;
pub mod diff;
pub mod git;
pub mod health;
pub mod repository;

pub use config::{Config, RepositoryManifest};
pub use controller::{Controller, CycleSummary, Stage};
pub use daemon::Daemon;
pub use diff::{DiffRecord, FileDiff, Hunk};
pub use git::{GitCommand, GitExecutor, GitOutput, SystemGit};
pub use health::HealthCheck;
pub use repository::{CommitRecord, ExtractionSummary, Repository};
