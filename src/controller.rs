//! Controller - keeps the tracked repository set in line with configuration
//! and drives every repository through the clone, sync, log and diff stages
//!
//! Stages run one after another and each stage visits every tracked
//! repository before the next starts. A repository that fails any stage is
//! evicted: it leaves the tracked set and its clone and artifacts are deleted.
//! Nothing that happens to one repository stops the cycle.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RepositoryManifest};
use crate::git::GitExecutor;
use crate::repository::Repository;

const LOG_FILE_NAME: &str = "commits.log";

/// Pipeline stage a repository can be evicted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Clone,
    Sync,
    Log,
    Diff,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Clone, Stage::Sync, Stage::Log, Stage::Diff];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Clone => "clone",
            Stage::Sync => "sync",
            Stage::Log => "log",
            Stage::Diff => "diff",
        };
        f.write_str(name)
    }
}

/// Changes applied by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: usize,
}

/// Results from one complete cycle
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub tracked: usize,
    pub evicted: Vec<(String, Stage)>,
    pub artifacts_written: usize,
    pub artifacts_skipped: usize,
    pub commits_failed: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Owns the tracked repositories and runs the polling loop
pub struct Controller {
    config: Config,
    git: Arc<dyn GitExecutor>,
    manifest: RepositoryManifest,
    repositories: BTreeMap<String, Repository>,
}

impl Controller {
    pub fn new(config: Config, git: Arc<dyn GitExecutor>) -> Self {
        Self {
            config,
            git,
            manifest: RepositoryManifest::default(),
            repositories: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Last successfully loaded repository list
    pub fn manifest(&self) -> &RepositoryManifest {
        &self.manifest
    }

    pub fn repositories(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.values()
    }

    pub fn get(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.config.difference_dir().join(name)
    }

    fn scratch_dir(&self, name: &str) -> PathBuf {
        self.config.scratch_dir().join(name)
    }

    /// Prepare the clone root and pick up clones left by a previous run
    pub async fn initialize(&mut self) -> Result<usize> {
        let root = self.config.repositories_dir();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create repositories directory {}", root.display()))?;

        self.discover_existing().await
    }

    /// Register every usable clone under the clone root; anything else found
    /// there is deleted
    pub async fn discover_existing(&mut self) -> Result<usize> {
        let root = self.config.repositories_dir();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .with_context(|| format!("Failed to read repositories directory {}", root.display()))?;

        let mut found = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read repositories directory {}", root.display()))?
        {
            let path = entry.path();
            match Repository::discover(self.git.as_ref(), &path).await {
                Ok(repo) => {
                    debug!("Found existing clone {} ({})", repo.name(), repo.url());
                    self.repositories.insert(repo.name().to_string(), repo);
                    found += 1;
                }
                Err(e) => {
                    warn!(
                        "Removing {}: not a usable clone ({:#})",
                        path.display(),
                        e
                    );
                    remove_path(&path).await;
                }
            }
        }

        info!("Discovered {} existing clones in {}", found, root.display());
        Ok(found)
    }

    /// Re-read the repository list, keeping the previous one on failure
    pub fn reload(&mut self) -> bool {
        match self.config.load_manifest() {
            Ok(manifest) => {
                self.manifest = manifest;
                true
            }
            Err(e) => {
                warn!(
                    "Failed to reload repository list, using previous list of {} entries: {:#}",
                    self.manifest.len(),
                    e
                );
                false
            }
        }
    }

    /// Converge the tracked set onto `manifest`
    ///
    /// New names are added and names whose URL changed are recreated from
    /// scratch. Tracked repositories missing from `manifest` are kept.
    pub async fn reconcile(&mut self, manifest: &RepositoryManifest) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let root = self.config.repositories_dir();

        for (name, url) in manifest.iter() {
            match self.repositories.get(name) {
                Some(existing) if existing.url() == url => {
                    report.unchanged += 1;
                }
                Some(existing) => {
                    warn!(
                        "Repository {} changed url: {} -> {}; recreating",
                        name,
                        existing.url(),
                        url
                    );
                    existing.remove(&self.artifact_dir(name)).await;
                    remove_path(&self.scratch_dir(name)).await;
                    self.repositories
                        .insert(name.to_string(), Repository::new(name, root.join(name), url));
                    report.replaced.push(name.to_string());
                }
                None => {
                    debug!("Tracking new repository {} ({})", name, url);
                    self.repositories
                        .insert(name.to_string(), Repository::new(name, root.join(name), url));
                    report.added.push(name.to_string());
                }
            }
        }

        report
    }

    /// Run one stage over every tracked repository, evicting failures
    pub async fn run_stage(&mut self, stage: Stage, summary: &mut CycleSummary) {
        let names: Vec<String> = self.repositories.keys().cloned().collect();

        for name in names {
            let Some(repo) = self.repositories.get(&name) else {
                continue;
            };
            let git = self.git.as_ref();
            let artifact_dir = self.artifact_dir(&name);
            let scratch_dir = self.scratch_dir(&name);
            let log_file = scratch_dir.join(LOG_FILE_NAME);

            let result = match stage {
                Stage::Clone => repo.ensure_cloned(git).await.map(|_| ()),
                Stage::Sync => repo.sync(git).await,
                Stage::Log => repo.extract_log(git, &log_file).await,
                Stage::Diff => repo
                    .extract_diffs(git, &log_file, &artifact_dir, &scratch_dir)
                    .await
                    .map(|extracted| {
                        summary.artifacts_written += extracted.written;
                        summary.artifacts_skipped += extracted.skipped;
                        summary.commits_failed += extracted.failed;
                    }),
            };

            if let Err(e) = result {
                warn!(
                    "{} stage failed for {}; removing repository: {:#}",
                    stage, name, e
                );
                self.evict(&name).await;
                summary.evicted.push((name, stage));
            }
        }
    }

    /// Drop a repository from the tracked set and delete everything it owns
    pub async fn evict(&mut self, name: &str) {
        if let Some(repo) = self.repositories.remove(name) {
            repo.remove(&self.artifact_dir(name)).await;
            remove_path(&self.scratch_dir(name)).await;
        }
    }

    /// Reload, reconcile and run every stage once
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleSummary {
        let start = Instant::now();
        let mut summary = CycleSummary::default();

        self.reload();
        let manifest = self.manifest.clone();
        let report = self.reconcile(&manifest).await;
        if !report.added.is_empty() || !report.replaced.is_empty() {
            info!(
                "Reconciled repositories: {} added, {} replaced, {} unchanged",
                report.added.len(),
                report.replaced.len(),
                report.unchanged
            );
        }

        for stage in Stage::ALL {
            if cancel.is_cancelled() {
                info!("Cycle cancelled before {} stage", stage);
                summary.cancelled = true;
                break;
            }
            self.run_stage(stage, &mut summary).await;
        }

        summary.tracked = self.repositories.len();
        summary.duration = start.elapsed();
        summary
    }

    /// Run cycles until `cancel` fires, sleeping the poll interval between them
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let interval = self.config.poll_interval()?;

        info!("Polling loop started with interval: {:?}", interval);

        while !cancel.is_cancelled() {
            let summary = self.run_cycle(&cancel).await;
            log_cycle(&summary);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Polling loop exiting");
        Ok(())
    }
}

fn log_cycle(summary: &CycleSummary) {
    info!(
        "Cycle finished in {:.2}s: {} repositories, {} artifacts written, {} already present, {} commits failed, {} evicted",
        summary.duration.as_secs_f64(),
        summary.tracked,
        summary.artifacts_written,
        summary.artifacts_skipped,
        summary.commits_failed,
        summary.evicted.len()
    );
}

async fn remove_path(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::ScriptedGit;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const PATCH: &str = "\
abc123 msg
diff --git a.txt a.txt
--- a.txt
+++ a.txt
@@ -1 +1 @@
-old
+new
";

    struct Harness {
        temp: TempDir,
        git: Arc<ScriptedGit>,
        controller: Controller,
    }

    impl Harness {
        fn new(git: ScriptedGit) -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path();
            let config = Config {
                repositories_file: root.join("repositories.json").to_string_lossy().into_owned(),
                repositories_dir: root.join("repositories").to_string_lossy().into_owned(),
                difference_dir: root.join("difference").to_string_lossy().into_owned(),
                scratch_dir: Some(root.join("scratch").to_string_lossy().into_owned()),
                poll_interval: "1s".to_string(),
                ..Config::default()
            };
            let git = Arc::new(git);
            let controller = Controller::new(config, git.clone());
            Self { temp, git, controller }
        }

        fn write_manifest(&self, entries: &[(&str, &str)]) {
            let repositories: Vec<_> = entries
                .iter()
                .map(|(name, url)| serde_json::json!({"name": name, "url": url}))
                .collect();
            std::fs::write(
                self.temp.path().join("repositories.json"),
                serde_json::json!({ "repositories": repositories }).to_string(),
            )
            .unwrap();
        }

        fn artifact(&self, name: &str, hash: &str) -> PathBuf {
            self.temp
                .path()
                .join("difference")
                .join(name)
                .join(format!("{}.json", hash))
        }

        fn clone_dir(&self, name: &str) -> PathBuf {
            self.temp.path().join("repositories").join(name)
        }
    }

    fn names(controller: &Controller) -> Vec<&str> {
        controller.repositories().map(Repository::name).collect()
    }

    #[tokio::test]
    async fn test_reconcile_adds_new_entries() {
        let mut h = Harness::new(ScriptedGit::new());
        let manifest = RepositoryManifest::from_entries([("alpha", "u1"), ("beta", "u2")]);

        let report = h.controller.reconcile(&manifest).await;

        assert_eq!(report.added, vec!["alpha", "beta"]);
        assert_eq!(names(&h.controller), vec!["alpha", "beta"]);
        assert_eq!(h.controller.get("alpha").unwrap().path(), h.clone_dir("alpha"));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_entries_missing_from_config() {
        let mut h = Harness::new(ScriptedGit::new());
        h.controller
            .reconcile(&RepositoryManifest::from_entries([("alpha", "u1"), ("beta", "u2")]))
            .await;

        let report = h
            .controller
            .reconcile(&RepositoryManifest::from_entries([("beta", "u2"), ("gamma", "u3")]))
            .await;

        assert_eq!(report.added, vec!["gamma"]);
        assert_eq!(report.unchanged, 1);
        assert_eq!(names(&h.controller), vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_reconcile_url_change_recreates_repository() {
        let mut h = Harness::new(ScriptedGit::new().with_log("alpha", "abc123\nmsg").with_patch("abc123", PATCH));
        h.write_manifest(&[("alpha", "https://old.example/alpha.git")]);
        let cancel = CancellationToken::new();
        h.controller.run_cycle(&cancel).await;
        assert!(h.artifact("alpha", "abc123").exists());

        let report = h
            .controller
            .reconcile(&RepositoryManifest::from_entries([("alpha", "https://new.example/alpha.git")]))
            .await;

        assert_eq!(report.replaced, vec!["alpha"]);
        assert!(!h.clone_dir("alpha").exists());
        assert!(!h.artifact("alpha", "abc123").exists());
        assert_eq!(h.controller.get("alpha").unwrap().url(), "https://new.example/alpha.git");

        h.controller.run_stage(Stage::Clone, &mut CycleSummary::default()).await;
        let url = std::fs::read_to_string(h.clone_dir("alpha").join(".git/url")).unwrap();
        assert_eq!(url, "https://new.example/alpha.git");
    }

    #[tokio::test]
    async fn test_discovery_registers_clones_and_removes_strays() {
        let mut h = Harness::new(ScriptedGit::new());
        let existing = Repository::new("alpha", h.clone_dir("alpha"), "https://example.com/alpha.git");
        existing.ensure_cloned(h.git.as_ref()).await.unwrap();
        std::fs::create_dir_all(h.clone_dir("junk")).unwrap();
        std::fs::write(h.clone_dir("stray.txt"), "x").unwrap();

        let found = h.controller.initialize().await.unwrap();

        assert_eq!(found, 1);
        assert_eq!(h.controller.get("alpha"), Some(&existing));
        assert!(!h.clone_dir("junk").exists());
        assert!(!h.clone_dir("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_cycle_isolates_failing_repository() {
        let git = ScriptedGit::new()
            .with_log("alpha", "abc123\nmsg")
            .with_log("beta", "abc123\nmsg")
            .with_patch("abc123", PATCH);
        git.fail("alpha", "pull");
        let mut h = Harness::new(git);
        h.write_manifest(&[("alpha", "u1"), ("beta", "u2")]);

        let summary = h.controller.run_cycle(&CancellationToken::new()).await;

        assert_eq!(summary.evicted, vec![("alpha".to_string(), Stage::Sync)]);
        assert_eq!(summary.tracked, 1);
        assert_eq!(summary.artifacts_written, 1);
        assert!(h.controller.get("alpha").is_none());
        assert!(!h.clone_dir("alpha").exists());
        assert!(h.artifact("beta", "abc123").exists());

        let record: crate::diff::DiffRecord =
            serde_json::from_str(&std::fs::read_to_string(h.artifact("beta", "abc123")).unwrap())
                .unwrap();
        assert_eq!(record.files()[0].hunks[0].added, vec!["new"]);
    }

    #[tokio::test]
    async fn test_uncreatable_log_destination_evicts_repository() {
        let git = ScriptedGit::new()
            .with_log("alpha", "abc123\nmsg")
            .with_log("beta", "abc123\nmsg")
            .with_patch("abc123", PATCH);
        let mut h = Harness::new(git);
        h.write_manifest(&[("alpha", "u1"), ("beta", "u2")]);
        std::fs::create_dir_all(h.temp.path().join("scratch")).unwrap();
        std::fs::write(h.temp.path().join("scratch/alpha"), "in the way").unwrap();

        let summary = h.controller.run_cycle(&CancellationToken::new()).await;

        assert_eq!(summary.evicted, vec![("alpha".to_string(), Stage::Log)]);
        assert!(h.controller.get("alpha").is_none());
        assert!(!h.clone_dir("alpha").exists());
        assert!(!h.temp.path().join("scratch/alpha").exists());
        assert!(h.artifact("beta", "abc123").exists());
    }

    #[tokio::test]
    async fn test_uncreatable_artifact_dir_evicts_repository() {
        let git = ScriptedGit::new()
            .with_log("alpha", "abc123\nmsg")
            .with_log("beta", "abc123\nmsg")
            .with_patch("abc123", PATCH);
        let mut h = Harness::new(git);
        h.write_manifest(&[("alpha", "u1"), ("beta", "u2")]);
        std::fs::create_dir_all(h.temp.path().join("difference")).unwrap();
        std::fs::write(h.temp.path().join("difference/alpha"), "in the way").unwrap();

        let summary = h.controller.run_cycle(&CancellationToken::new()).await;

        assert_matches!(summary.evicted.as_slice(), [(name, Stage::Diff)] if name == "alpha");
        assert!(h.controller.get("alpha").is_none());
        assert!(!h.clone_dir("alpha").exists());
        assert!(!h.temp.path().join("difference/alpha").exists());
        assert!(h.artifact("beta", "abc123").exists());
        assert_eq!(summary.artifacts_written, 1);
    }

    #[tokio::test]
    async fn test_evicted_repository_returns_next_cycle() {
        let git = ScriptedGit::new().with_log("alpha", "abc123\nmsg").with_patch("abc123", PATCH);
        git.fail("alpha", "log");
        let mut h = Harness::new(git);
        h.write_manifest(&[("alpha", "u1")]);

        let first = h.controller.run_cycle(&CancellationToken::new()).await;
        assert_matches!(first.evicted.as_slice(), [(name, Stage::Log)] if name == "alpha");

        h.git.failing.lock().unwrap().clear();
        let second = h.controller.run_cycle(&CancellationToken::new()).await;
        assert!(second.evicted.is_empty());
        assert!(h.artifact("alpha", "abc123").exists());
        assert_eq!(h.git.count("clone"), 2);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_manifest() {
        let mut h = Harness::new(ScriptedGit::new());
        h.write_manifest(&[("alpha", "u1")]);
        assert!(h.controller.reload());

        std::fs::write(h.temp.path().join("repositories.json"), "{ broken").unwrap();
        assert!(!h.controller.reload());
        assert_eq!(h.controller.manifest().get("alpha"), Some("u1"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_runs_no_stage() {
        let mut h = Harness::new(ScriptedGit::new());
        h.write_manifest(&[("alpha", "u1")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.controller.run_cycle(&cancel).await;

        assert!(summary.cancelled);
        assert_eq!(h.git.count("clone"), 0);
        assert_eq!(names(&h.controller), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let mut h = Harness::new(ScriptedGit::new().with_log("alpha", "abc123\nmsg").with_patch("abc123", PATCH));
        h.write_manifest(&[("alpha", "u1")]);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let (result, _) = tokio::join!(h.controller.run(cancel), async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        assert!(result.is_ok());
        assert!(h.artifact("alpha", "abc123").exists());
    }
}
