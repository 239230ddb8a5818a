//! A single tracked repository and its pipeline operations
//!
//! Each operation returns its own `Result`; deciding what a failure means for
//! the repository (eviction) is left to the [`crate::controller`]. Per-commit
//! failures inside [`Repository::extract_diffs`] never fail the operation.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::diff::DiffRecord;
use crate::git::{GitCommand, GitExecutor};

/// `git show` arguments that render a patch the diff parser understands
const SHOW_ARGS: &[&str] = &[
    "--oneline",
    "--patch",
    "--unified=0",
    "--minimal",
    "--no-color",
    "--src-prefix=",
    "--dst-prefix=",
    "--output-indicator-new=+",
    "--output-indicator-old=-",
    "--ignore-blank-lines",
    "--ignore-space-change",
];

/// One tracked repository: its name, local clone path and remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    name: String,
    path: PathBuf,
    url: String,
}

/// A commit listed by [`Repository::extract_log`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub hash: String,
    pub subject: String,
}

/// Outcome of one diff extraction pass over a log file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Repository {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            url: url.into(),
        }
    }

    /// Rebuild a record from an existing clone, reading its remote URL
    pub async fn discover(git: &dyn GitExecutor, path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Clone path has no directory name: {}", path.display()))?;
        let url = Self::introspect_url(git, path).await?;

        Ok(Self::new(name, path, url))
    }

    /// Read `remote.origin.url` from a local clone
    pub async fn introspect_url(git: &dyn GitExecutor, path: &Path) -> Result<String> {
        if !is_dir(path).await {
            return Err(anyhow!("Not a directory: {}", path.display()));
        }

        let command = GitCommand::new("config")
            .args(["--get", "remote.origin.url"])
            .current_dir(path);
        let output = git.run(&command).await?.check(&command)?;

        let url = output.stdout.lines().next().unwrap_or_default().trim();
        if url.is_empty() {
            return Err(anyhow!("No remote URL configured in {}", path.display()));
        }

        Ok(url.to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A clone exists once `<path>/.git` is a directory
    pub async fn is_cloned(&self) -> bool {
        is_dir(&self.path.join(".git")).await
    }

    /// Clone the remote unless a local clone already exists
    ///
    /// Returns `true` when a fresh clone was made.
    pub async fn ensure_cloned(&self, git: &dyn GitExecutor) -> Result<bool> {
        if self.is_cloned().await {
            return Ok(false);
        }

        info!("Cloning repository: {} -> {}", self.url, self.path.display());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create clone root {}", parent.display()))?;
        }

        let command = GitCommand::new("clone")
            .arg("--quiet")
            .arg(&self.url)
            .arg(&self.path);
        git.run(&command).await?.check(&command)?;

        Ok(true)
    }

    /// Fetch and merge every remote branch
    pub async fn sync(&self, git: &dyn GitExecutor) -> Result<()> {
        debug!("Pulling {}", self.name);

        let command = GitCommand::new("pull")
            .args(["--quiet", "--all"])
            .current_dir(&self.path);
        git.run(&command).await?.check(&command)?;

        Ok(())
    }

    /// Write every reachable commit as a `hash` line followed by a `subject`
    /// line, newest first, to `dest`
    pub async fn extract_log(&self, git: &dyn GitExecutor, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let command = GitCommand::new("log")
            .arg("--pretty=format:%H%n%s")
            .current_dir(&self.path);
        let output = git.run(&command).await?.check(&command)?;

        tokio::fs::write(dest, output.stdout)
            .await
            .with_context(|| format!("Failed to write log file {}", dest.display()))?;

        Ok(())
    }

    /// Write one artifact per logged commit into `out_dir`
    ///
    /// Commits whose `{hash}.json` already exists are skipped without running
    /// git. A failing commit is logged and skipped; only an unreadable log or
    /// an uncreatable `out_dir` fails the whole operation.
    pub async fn extract_diffs(
        &self,
        git: &dyn GitExecutor,
        log_file: &Path,
        out_dir: &Path,
        scratch_dir: &Path,
    ) -> Result<ExtractionSummary> {
        let log = tokio::fs::read_to_string(log_file)
            .await
            .with_context(|| format!("Failed to read log file {}", log_file.display()))?;

        for dir in [out_dir, scratch_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        let mut summary = ExtractionSummary::default();

        for commit in parse_log(&log) {
            let artifact = out_dir.join(format!("{}.json", commit.hash));
            if tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
                summary.skipped += 1;
                continue;
            }

            match self.write_artifact(git, &commit, &artifact, scratch_dir).await {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "Skipping commit {} of {} ({}): {:#}",
                        commit.hash, self.name, self.url, e
                    );
                }
            }
        }

        debug!(
            "{}: {} artifacts written, {} already present, {} failed",
            self.name, summary.written, summary.skipped, summary.failed
        );

        Ok(summary)
    }

    async fn write_artifact(
        &self,
        git: &dyn GitExecutor,
        commit: &CommitRecord,
        artifact: &Path,
        scratch_dir: &Path,
    ) -> Result<()> {
        let command = GitCommand::new("show")
            .args(SHOW_ARGS)
            .arg(&commit.hash)
            .current_dir(&self.path);
        let output = git.run(&command).await?.check(&command)?;

        let patch_file = scratch_dir.join(format!("{}.patch", commit.hash));
        tokio::fs::write(&patch_file, &output.stdout)
            .await
            .with_context(|| format!("Failed to write patch {}", patch_file.display()))?;

        let result = render_artifact(commit, &patch_file, artifact).await;

        if let Err(e) = tokio::fs::remove_file(&patch_file).await {
            debug!("Failed to remove {}: {}", patch_file.display(), e);
        }

        result
    }

    /// Delete the local clone and `artifact_dir`; missing paths are fine
    pub async fn remove(&self, artifact_dir: &Path) {
        for path in [self.path.as_path(), artifact_dir] {
            let result = match tokio::fs::symlink_metadata(path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
                Ok(_) => tokio::fs::remove_file(path).await,
                Err(_) => continue,
            };
            match result {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Split a log listing into (hash, subject) pairs
pub fn parse_log(text: &str) -> Vec<CommitRecord> {
    let mut lines = text.lines();
    let mut commits = Vec::new();

    while let Some(hash) = lines.next() {
        let subject = lines.next().unwrap_or_default();
        let hash = hash.trim();
        if hash.is_empty() {
            continue;
        }
        commits.push(CommitRecord {
            hash: hash.to_string(),
            subject: subject.to_string(),
        });
    }

    commits
}

/// Parse a captured patch into `artifact`
///
/// `{hash}.json` only ever appears complete; a failed write leaves no
/// artifact behind.
async fn render_artifact(commit: &CommitRecord, patch_file: &Path, artifact: &Path) -> Result<()> {
    let patch = tokio::fs::read_to_string(patch_file)
        .await
        .with_context(|| format!("Failed to read patch {}", patch_file.display()))?;

    let record = DiffRecord::from_patch(&commit.hash, &commit.subject, &patch);
    let json = serde_json::to_string_pretty(&record).context("Failed to serialize diff")?;

    let partial = artifact.with_extension("json.tmp");
    let written = match tokio::fs::write(&partial, json).await {
        Ok(()) => tokio::fs::rename(&partial, artifact)
            .await
            .with_context(|| format!("Failed to move artifact into {}", artifact.display())),
        Err(e) => Err(e).with_context(|| format!("Failed to write {}", partial.display())),
    };

    if written.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }

    written
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
