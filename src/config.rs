use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Main configuration structure for diffwatch
///
/// A `Config` is an immutable snapshot. The repository list it points at is
/// re-read every cycle through [`Config::load_manifest`], which hands back a
/// fresh [`RepositoryManifest`] instead of mutating shared state.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// JSON file listing the repositories to track
    #[serde(default = "default_repositories_file")]
    pub repositories_file: String,

    /// Root directory for local clones
    #[serde(default = "default_repositories_dir")]
    pub repositories_dir: String,

    /// Root directory for per-commit diff artifacts
    #[serde(default = "default_difference_dir")]
    pub difference_dir: String,

    /// Scratch space for log listings and raw patches (system temp dir if unset)
    #[serde(default)]
    pub scratch_dir: Option<String>,

    /// Time to sleep between cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String, // "1h"

    /// Git executable settings
    #[serde(default)]
    pub git: GitConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Git executable configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    /// Path or name of the git binary
    #[serde(default = "default_git_binary")]
    pub binary: String,

    /// Timeout for a single git invocation in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_repositories_file() -> String {
    "./repositories.json".to_string()
}
fn default_repositories_dir() -> String {
    "./repositories".to_string()
}
fn default_difference_dir() -> String {
    "./difference".to_string()
}
fn default_poll_interval() -> String {
    "1h".to_string()
}
fn default_git_binary() -> String {
    "git".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/diffwatch.pid", runtime_dir)
    } else {
        "/tmp/diffwatch.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/diffwatch/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/diffwatch/daemon.log", home)
    } else {
        "/tmp/diffwatch-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            timeout: default_timeout(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("diffwatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.repositories_file = expand(&self.repositories_file, "repositories_file")?;
        self.repositories_dir = expand(&self.repositories_dir, "repositories_dir")?;
        self.difference_dir = expand(&self.difference_dir, "difference_dir")?;
        if let Some(scratch) = &self.scratch_dir {
            self.scratch_dir = Some(expand(scratch, "scratch_dir")?);
        }
        self.daemon.pid_file = expand(&self.daemon.pid_file, "pid_file")?;
        self.daemon.log_file = expand(&self.daemon.log_file, "log_file")?;

        Ok(())
    }

    pub fn repositories_file(&self) -> PathBuf {
        PathBuf::from(&self.repositories_file)
    }

    /// Clone root: `{repositories_dir}/{name}` is one local clone
    pub fn repositories_dir(&self) -> PathBuf {
        PathBuf::from(&self.repositories_dir)
    }

    /// Artifact root: `{difference_dir}/{name}/{hash}.json`
    pub fn difference_dir(&self) -> PathBuf {
        PathBuf::from(&self.difference_dir)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        match &self.scratch_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join("diffwatch"),
        }
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
            .with_context(|| format!("Invalid poll_interval: {:?}", self.poll_interval))
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout)
    }

    /// Read the repository list and return a new snapshot of it
    pub fn load_manifest(&self) -> Result<RepositoryManifest> {
        RepositoryManifest::load(&self.repositories_file())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repositories_file: default_repositories_file(),
            repositories_dir: default_repositories_dir(),
            difference_dir: default_difference_dir(),
            scratch_dir: None,
            poll_interval: default_poll_interval(),
            git: GitConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn expand(value: &str, key: &str) -> Result<String> {
    Ok(shellexpand::full(value)
        .with_context(|| format!("Failed to expand {} path", key))?
        .into_owned())
}

/// Parse duration strings like "30m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, what) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1, "seconds")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60, "minutes")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3600, "hours")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, 86400, "days")
    } else {
        let secs = duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?;
        return Ok(Duration::from_secs(secs));
    };

    let secs = value
        .parse::<u64>()
        .with_context(|| format!("Invalid {} value", what))?
        .checked_mul(unit)
        .ok_or_else(|| anyhow!("Duration out of range: {}", duration_str))?;

    Ok(Duration::from_secs(secs))
}

/// One entry of the repository list file
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    repositories: Option<Vec<ManifestEntry>>,
}

/// Resolved name → remote URL mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryManifest {
    repositories: BTreeMap<String, String>,
}

impl RepositoryManifest {
    /// Read `{"repositories": [{"name": .., "url": ..}, ...]}` from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read repository list: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid repository list: {:?}", path))
    }

    /// Parse the repository list. Incomplete entries are skipped; on duplicate
    /// names the first entry wins.
    pub fn parse(content: &str) -> Result<Self> {
        let file: ManifestFile =
            serde_json::from_str(content).context("Failed to parse repository list JSON")?;

        let entries = file
            .repositories
            .ok_or_else(|| anyhow!("Missing \"repositories\" array"))?;

        let mut repositories = BTreeMap::new();
        let mut incomplete = 0usize;

        for entry in entries {
            let (Some(name), Some(url)) = (entry.name, entry.url) else {
                incomplete += 1;
                continue;
            };

            if let Some(existing) = repositories.get(&name) {
                warn!(
                    "Duplicate repository name {:?}; keeping url {}, ignoring {}",
                    name, existing, url
                );
                continue;
            }

            repositories.insert(name, url);
        }

        if incomplete > 0 {
            warn!(
                "Ignored {} repository entries without both name and url",
                incomplete
            );
        }

        Ok(Self { repositories })
    }

    pub fn from_entries<I, N, U>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, U)>,
        N: Into<String>,
        U: Into<String>,
    {
        Self {
            repositories: entries
                .into_iter()
                .map(|(name, url)| (name.into(), url.into()))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.repositories
            .iter()
            .map(|(name, url)| (name.as_str(), url.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.repositories.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.repositories_file, "./repositories.json");
        assert_eq!(config.repositories_dir, "./repositories");
        assert_eq!(config.difference_dir, "./difference");
        assert!(config.scratch_dir.is_none());
        assert_eq!(config.poll_interval, "1h");
        assert_eq!(config.git.binary, "git");
        assert_eq!(config.git.timeout, 300);
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 2D ").unwrap(), Duration::from_secs(172800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_error() {
        assert!(parse_duration("300000000000000d").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX / 60)).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );

        let mut config = Config::default();
        config.poll_interval = "300000000000000d".to_string();
        assert!(config.poll_interval().is_err());
    }

    #[test]
    fn test_poll_interval_error_mentions_key() {
        let mut config = Config::default();
        config.poll_interval = "every hour".to_string();

        let err = config.poll_interval().unwrap_err();
        assert!(format!("{:#}", err).contains("poll_interval"));
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_DIFFWATCH_HOME", "/test/home");

        let mut config = Config::default();
        config.repositories_dir = "${TEST_DIFFWATCH_HOME}/clones".to_string();
        config.scratch_dir = Some("$TEST_DIFFWATCH_HOME/scratch".to_string());

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.repositories_dir, "/test/home/clones");
        assert_eq!(config.scratch_dir.as_deref(), Some("/test/home/scratch"));

        env::remove_var("TEST_DIFFWATCH_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.repositories_dir = "/custom/clones".to_string();
        config.poll_interval = "6h".to_string();
        config.git.timeout = 60;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.repositories_dir, "/custom/clones");
        assert_eq!(loaded.poll_interval().unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(loaded.git_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
repositories_file: "/etc/diffwatch/repositories.json"
repositories_dir: "/var/lib/diffwatch/clones"
difference_dir: "/var/lib/diffwatch/difference"
scratch_dir: "/var/tmp/diffwatch"
poll_interval: "2h"
git:
  binary: "/usr/local/bin/git"
logging:
  level: "debug"
  format: "full"
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.repositories_file(), PathBuf::from("/etc/diffwatch/repositories.json"));
        assert_eq!(config.repositories_dir(), PathBuf::from("/var/lib/diffwatch/clones"));
        assert_eq!(config.difference_dir(), PathBuf::from("/var/lib/diffwatch/difference"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/var/tmp/diffwatch"));
        assert_eq!(config.git.binary, "/usr/local/bin/git");
        assert_eq!(config.git.timeout, 300);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.color);
    }

    #[test]
    fn test_manifest_parsing() {
        let manifest = RepositoryManifest::parse(
            r#"{
                "repositories": [
                    {"name": "alpha", "url": "https://example.com/alpha.git"},
                    {"name": "beta", "url": "https://example.com/beta.git"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get("alpha"), Some("https://example.com/alpha.git"));
        assert_eq!(manifest.get("beta"), Some("https://example.com/beta.git"));
    }

    #[test]
    fn test_manifest_first_duplicate_wins_and_incomplete_skipped() {
        let manifest = RepositoryManifest::parse(
            r#"{
                "repositories": [
                    {"name": "alpha", "url": "first"},
                    {"name": "alpha", "url": "second"},
                    {"name": "no-url"},
                    {"url": "no-name"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("alpha"), Some("first"));
    }

    #[test]
    fn test_manifest_requires_repositories_key() {
        assert!(RepositoryManifest::parse(r#"{"repos": []}"#).is_err());
        assert!(RepositoryManifest::parse("not json").is_err());
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.repositories_file = temp_dir
            .path()
            .join("missing.json")
            .to_string_lossy()
            .into_owned();

        assert!(config.load_manifest().is_err());
    }
}
