/// Common test utilities and helpers for diffwatch tests
use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Self-contained directory layout with its own config and repository list
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let env = Self { temp_dir };
        env.write_config();
        env.write_repositories(&[]);
        env
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("config.yml")
    }

    pub fn difference_dir(&self, name: &str) -> PathBuf {
        self.path().join("difference").join(name)
    }

    pub fn clone_dir(&self, name: &str) -> PathBuf {
        self.path().join("repositories").join(name)
    }

    fn write_config(&self) {
        let root = self.path().display();
        self.temp_dir
            .child("config.yml")
            .write_str(&format!(
                r#"
repositories_file: "{root}/repositories.json"
repositories_dir: "{root}/repositories"
difference_dir: "{root}/difference"
scratch_dir: "{root}/scratch"
poll_interval: "1h"
logging:
  level: "info"
  color: false
daemon:
  pid_file: "{root}/diffwatch.pid"
  log_file: "{root}/daemon.log"
"#
            ))
            .expect("Failed to write test config");
    }

    pub fn write_repositories(&self, entries: &[(&str, &str)]) {
        let repositories: Vec<_> = entries
            .iter()
            .map(|(name, url)| serde_json::json!({ "name": name, "url": url }))
            .collect();
        self.temp_dir
            .child("repositories.json")
            .write_str(&serde_json::json!({ "repositories": repositories }).to_string())
            .expect("Failed to write repository list");
    }

    /// Run the binary with this environment's config
    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_diffwatch"))
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to execute diffwatch")
    }

    /// Artifacts written for a repository, sorted by file name
    pub fn artifacts(&self, name: &str) -> Vec<serde_json::Value> {
        let Ok(entries) = std::fs::read_dir(self.difference_dir(name)) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|p| serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap())
            .collect()
    }
}

pub fn diffwatch() -> Command {
    Command::new(env!("CARGO_BIN_EXE_diffwatch"))
}

/// Whether a usable git binary is on PATH
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git in `dir` with a throwaway identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=diffwatch test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Source repository that tests commit into and diffwatch clones from
pub struct Origin {
    pub path: PathBuf,
}

#[allow(dead_code)]
impl Origin {
    pub fn create(parent: &Path, name: &str) -> Self {
        let path = parent.join(name);
        std::fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "-q"]);
        Self { path }
    }

    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Write `content` to `file` and commit it, returning the new hash
    pub fn commit(&self, file: &str, content: &str, subject: &str) -> String {
        std::fs::write(self.path.join(file), content).unwrap();
        git(&self.path, &["add", file]);
        git(&self.path, &["commit", "-q", "-m", subject]);
        git(&self.path, &["rev-parse", "HEAD"]).trim().to_string()
    }
}
