use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;

/// A single git invocation: subcommand, arguments and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl GitCommand {
    pub fn new(subcommand: &str) -> Self {
        Self {
            args: vec![OsString::from(subcommand)],
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn subcommand(&self) -> &str {
        self.args.first().and_then(|a| a.to_str()).unwrap_or("")
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// The last argument, e.g. the commit passed to `show`
    pub fn last_arg(&self) -> Option<&str> {
        self.args.last().and_then(|a| a.to_str())
    }
}

impl std::fmt::Display for GitCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "git")?;
        if let Some(dir) = &self.current_dir {
            write!(f, " -C {}", dir.display())?;
        }
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished git process
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Turn a non-zero exit into an error carrying git's stderr
    pub fn check(self, command: &GitCommand) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow!(
                "`{}` exited with {}: {}",
                command,
                self.code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                self.stderr.trim()
            ))
        }
    }
}

/// Runs git subcommands on behalf of the pipeline
///
/// Spawn failures and timeouts are errors; a process that ran and exited
/// non-zero is reported through [`GitOutput::success`].
#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, command: &GitCommand) -> Result<GitOutput>;
}

/// Executor backed by the system git binary
#[derive(Debug, Clone)]
pub struct SystemGit {
    binary: String,
    timeout: Duration,
}

impl SystemGit {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.git.binary.clone(), config.git_timeout())
    }
}

impl Default for SystemGit {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[async_trait]
impl GitExecutor for SystemGit {
    async fn run(&self, command: &GitCommand) -> Result<GitOutput> {
        debug!("Running {}", command);

        let mut process = AsyncCommand::new(&self.binary);
        process
            .args(command.get_args())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = command.get_current_dir() {
            process.current_dir(dir);
        }

        let output = match timeout(self.timeout, process.output()).await {
            Ok(output) => output.with_context(|| format!("Failed to execute {}", command))?,
            Err(_) => {
                return Err(anyhow!(
                    "`{}` timed out after {}s",
                    command,
                    self.timeout.as_secs()
                ))
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
