//! System health checks for diffwatch
//!
//! Preflight checks run by `diffwatch doctor` to verify git is usable and the
//! configured paths can be read and written before the polling loop starts.

use crate::Config;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Repository list status
    pub repository_list: CheckResult,
    /// Clone root status
    pub repositories_dir: CheckResult,
    /// Artifact root status
    pub difference_dir: CheckResult,
    /// Scratch directory status
    pub scratch_dir: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::ok(message)
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(&config.git.binary),
            repository_list: Self::check_repository_list(config),
            repositories_dir: Self::check_directory("Repositories directory", &config.repositories_dir()),
            difference_dir: Self::check_directory("Difference directory", &config.difference_dir()),
            scratch_dir: Self::check_directory("Scratch directory", &config.scratch_dir()),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git(binary: &str) -> CheckResult {
        match std::process::Command::new(binary).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(output) => CheckResult::error_with_details(
                "Git command failed",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(_) => CheckResult::error_with_details(
                format!("Git not found: {}", binary),
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Check the repository list can be read and parsed
    fn check_repository_list(config: &Config) -> CheckResult {
        match config.load_manifest() {
            Ok(manifest) if manifest.is_empty() => CheckResult::warning_with_details(
                "Repository list is empty",
                config.repositories_file.clone(),
            ),
            Ok(manifest) => CheckResult::ok_with_details(
                format!("Repository list has {} entries", manifest.len()),
                config.repositories_file.clone(),
            ),
            Err(e) => CheckResult::error_with_details("Repository list unusable", format!("{:#}", e)),
        }
    }

    /// Check a directory exists and is writable, or can be created
    fn check_directory(label: &str, path: &Path) -> CheckResult {
        match std::fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => CheckResult::error_with_details(
                format!("{} is not a directory", label),
                path.display().to_string(),
            ),
            Ok(meta) if meta.permissions().readonly() => CheckResult::error_with_details(
                format!("{} is read-only", label),
                path.display().to_string(),
            ),
            Ok(_) => CheckResult::ok_with_details(format!("{} exists", label), path.display().to_string()),
            Err(_) => {
                let creatable = path
                    .ancestors()
                    .skip(1)
                    .find(|p| p.exists())
                    .map(|p| p.is_dir())
                    .unwrap_or(false);
                if creatable {
                    CheckResult::warning_with_details(
                        format!("{} does not exist yet", label),
                        format!("It will be created: {}", path.display()),
                    )
                } else {
                    CheckResult::error_with_details(
                        format!("{} cannot be created", label),
                        path.display().to_string(),
                    )
                }
            }
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("Repository List", &self.repository_list),
            ("Repositories Directory", &self.repositories_dir),
            ("Difference Directory", &self.difference_dir),
            ("Scratch Directory", &self.scratch_dir),
        ]
    }
}
