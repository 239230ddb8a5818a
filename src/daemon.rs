//! Daemon Infrastructure - Background service around the polling loop
//!
//! Handles PID file management, detaching from the terminal and turning
//! SIGINT/SIGTERM into cancellation of the [`Controller`] loop.

use crate::controller::Controller;
use crate::git::SystemGit;
use crate::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Daemon state and control
pub struct Daemon {
    config: Config,
    pid_file_path: Option<PathBuf>,
}

/// Snapshot of a daemon as seen from another process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub pid: Option<u32>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Self {
        let pid_file_path = if config.daemon.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.daemon.pid_file))
        };

        Self {
            config,
            pid_file_path,
        }
    }

    /// Run the polling loop in the current process until a shutdown signal
    pub async fn run(&self) -> Result<()> {
        info!("Starting diffwatch daemon");

        self.write_pid_file().context("Failed to write PID file")?;

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping after the current stage...");
            signal_cancel.cancel();
        });

        let result = self.run_until(cancel).await;

        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Run the polling loop until `cancel` fires
    pub async fn run_until(&self, cancel: CancellationToken) -> Result<()> {
        let git = Arc::new(SystemGit::from_config(&self.config));
        let mut controller = Controller::new(self.config.clone(), git);

        controller
            .initialize()
            .await
            .context("Failed to initialize repository controller")?;
        controller.run(cancel).await
    }

    /// Detach from the terminal (Unix platforms)
    ///
    /// Must be called before any async runtime is started.
    #[cfg(unix)]
    pub fn daemonize(&self) -> Result<()> {
        use daemonize::Daemonize;

        let log_file = if !self.config.daemon.log_file.is_empty() {
            let path = PathBuf::from(&self.config.daemon.log_file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context("Failed to open log file")?;
            Some(log_file)
        } else {
            None
        };

        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let mut daemonize = Daemonize::new().working_directory(cwd);

        if let Some(log_file) = log_file {
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        Ok(())
    }

    /// Stop a running daemon by sending SIGTERM to the PID on file
    pub fn stop(&self) -> Result<()> {
        info!("Sending shutdown signal to daemon");

        let Some(pid) = self.read_pid()? else {
            warn!("PID file not found, daemon may not be running");
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .context("Failed to send SIGTERM to daemon process")?;
        }

        #[cfg(not(unix))]
        {
            warn!("Daemon stop not implemented for this platform");
        }

        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(())
    }

    /// Check whether the PID on file belongs to a live process
    pub fn status(&self) -> Result<DaemonStatus> {
        let Some(pid) = self.read_pid()? else {
            return Ok(DaemonStatus {
                is_running: false,
                pid: None,
            });
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal;
            use nix::unistd::Pid;

            match signal::kill(Pid::from_raw(pid as i32), None) {
                Ok(_) => Ok(DaemonStatus {
                    is_running: true,
                    pid: Some(pid),
                }),
                Err(Errno::ESRCH) => {
                    // Stale PID file
                    if let Some(pid_file) = &self.pid_file_path {
                        let _ = fs::remove_file(pid_file);
                    }
                    Ok(DaemonStatus {
                        is_running: false,
                        pid: None,
                    })
                }
                Err(_) => Ok(DaemonStatus {
                    is_running: true,
                    pid: Some(pid),
                }),
            }
        }

        #[cfg(not(unix))]
        {
            Ok(DaemonStatus {
                is_running: true,
                pid: Some(pid),
            })
        }
    }

    fn read_pid(&self) -> Result<Option<u32>> {
        let Some(pid_file) = &self.pid_file_path else {
            return Ok(None);
        };
        if !pid_file.exists() {
            return Ok(None);
        }

        let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
        let pid = pid_str.trim().parse().context("Invalid PID in PID file")?;
        Ok(Some(pid))
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = sigterm.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
