use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use diffwatch::config::LoggingConfig;
use diffwatch::health::CheckResult;
use diffwatch::{
    Config, Controller, Daemon, DiffRecord, HealthCheck, Repository, RepositoryManifest, SystemGit,
};

#[derive(Parser)]
#[command(name = "diffwatch")]
#[command(about = "Watch git repositories and extract every commit's diff as JSON")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file and an empty repository list
    Init {
        /// Repository list file
        #[arg(long, default_value = "./repositories.json")]
        repositories_file: String,

        /// Directory for local clones
        #[arg(long, default_value = "./repositories")]
        repositories_dir: String,

        /// Directory for diff artifacts
        #[arg(long, default_value = "./difference")]
        difference_dir: String,
    },

    /// Run a single clone/sync/log/diff cycle and exit
    Once,

    /// Run the polling loop as a daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// Show configured repositories and their local state
    List,

    /// Parse a saved `git show` patch and print its diff artifact
    Parse {
        /// Patch file rendered with zero context and +/- markers
        patch: PathBuf,

        /// Commit hash (defaults to the first word of the patch)
        #[arg(long)]
        hash: Option<String>,

        /// Commit subject (defaults to the rest of the first line)
        #[arg(long)]
        subject: Option<String>,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Parsing a patch needs no configuration
    if let Commands::Parse {
        patch,
        hash,
        subject,
    } = &cli.command
    {
        return cmd_parse(patch, hash.clone(), subject.clone());
    }

    let config = match (&cli.command, cli.config.as_deref()) {
        // `init` is what creates the file
        (Commands::Init { .. }, Some(path)) if !path.exists() => Config::default(),
        (_, path) => load_config(path)?,
    };

    // Detach before logging and the runtime start so neither crosses the fork
    let background = matches!(
        cli.command,
        Commands::Daemon {
            daemon_command: DaemonCommands::Start { foreground: false }
        }
    );
    if background {
        let daemon = Daemon::new(config.clone());
        if daemon.status()?.is_running {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'diffwatch daemon stop' to stop it first");
            return Ok(());
        }
        println!("🚀 Starting diffwatch daemon in background...");
        println!("   Log file: {}", config.daemon.log_file);
        #[cfg(unix)]
        daemon.daemonize()?;
    }

    init_logging(cli.verbose, &config.logging, config.logging.color && !background);
    info!("Starting diffwatch v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init {
            repositories_file,
            repositories_dir,
            difference_dir,
        } => cmd_init(
            cli.config,
            &config,
            repositories_file,
            repositories_dir,
            difference_dir,
        ),
        Commands::Once => runtime()?.block_on(cmd_once(config)),
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, config),
        Commands::List => runtime()?.block_on(cmd_list(&config)),
        Commands::Doctor => cmd_doctor(&config),
        Commands::Parse { .. } => Ok(()),
    }
}

/// Initialize logging from configuration and verbosity
fn init_logging(verbose: bool, logging: &LoggingConfig, ansi: bool) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "full" {
        registry.with(fmt::layer().with_ansi(ansi)).init();
    } else {
        registry.with(fmt::layer().compact().with_ansi(ansi)).init();
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Write configuration and an empty repository list
fn cmd_init(
    config_path: Option<PathBuf>,
    config: &Config,
    repositories_file: String,
    repositories_dir: String,
    difference_dir: String,
) -> Result<()> {
    info!("Initializing diffwatch...");

    let mut new_config = config.clone();
    new_config.repositories_file = repositories_file;
    new_config.repositories_dir = repositories_dir;
    new_config.difference_dir = difference_dir;
    new_config.expand_paths()?;

    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    new_config.save(&config_path)?;

    for dir in [new_config.repositories_dir(), new_config.difference_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let list = new_config.repositories_file();
    if !list.exists() {
        std::fs::write(&list, "{\n    \"repositories\": []\n}\n")
            .with_context(|| format!("Failed to write repository list {}", list.display()))?;
    }

    println!("✅ diffwatch initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Repository list: {}", list.display());
    println!("   Next: add repositories to the list and run 'diffwatch once'");

    Ok(())
}

/// Run one cycle; Ctrl+C stops it between stages
async fn cmd_once(config: Config) -> Result<()> {
    let git = Arc::new(SystemGit::from_config(&config));
    let mut controller = Controller::new(config, git);
    controller.initialize().await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let summary = controller.run_cycle(&cancel).await;

    println!("\n🎉 Cycle Complete!");
    println!("   📊 Tracked repositories: {}", summary.tracked);
    println!("   📝 Artifacts written: {}", summary.artifacts_written);
    println!("   ⏭️  Already present: {}", summary.artifacts_skipped);
    println!("   ❌ Failed commits: {}", summary.commits_failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if !summary.evicted.is_empty() {
        println!("\n🔍 Evicted Repositories:");
        for (name, stage) in &summary.evicted {
            println!("   ❌ {} ({} failed)", name, stage);
        }
    }

    if summary.cancelled {
        println!("\n⚠️  Cycle was interrupted");
    }

    Ok(())
}

/// Handle daemon commands
fn cmd_daemon(daemon_command: DaemonCommands, config: Config) -> Result<()> {
    let daemon = Daemon::new(config);

    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                if daemon.status()?.is_running {
                    println!("⚠️  Daemon is already running!");
                    return Ok(());
                }
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }
            runtime()?.block_on(daemon.run())
        }

        DaemonCommands::Stop => {
            if !daemon.status()?.is_running {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }
            daemon.stop()?;
            println!("✅ Daemon stop signal sent");
            Ok(())
        }

        DaemonCommands::Status => {
            let status = daemon.status()?;
            println!("📊 diffwatch Daemon Status");
            match status.pid {
                Some(pid) if status.is_running => println!("   🟢 Status: Running (PID {})", pid),
                _ => {
                    println!("   🔴 Status: Not running");
                    println!("   💡 Use 'diffwatch daemon start' to start the daemon");
                }
            }
            Ok(())
        }
    }
}

/// List configured repositories and any clones the list no longer names
async fn cmd_list(config: &Config) -> Result<()> {
    let manifest = match config.load_manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            println!("⚠️  Repository list unusable: {:#}", e);
            RepositoryManifest::default()
        }
    };

    let git = SystemGit::from_config(config);
    let mut clones: BTreeMap<String, Option<String>> = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(config.repositories_dir()) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.join(".git").is_dir() {
                continue;
            }
            let url = Repository::introspect_url(&git, &path).await.ok();
            clones.insert(entry.file_name().to_string_lossy().into_owned(), url);
        }
    }

    let untracked: Vec<_> = clones
        .iter()
        .filter(|(name, _)| manifest.get(name).is_none())
        .collect();

    println!(
        "Repositories ({} configured, {} cloned):",
        manifest.len(),
        clones.len()
    );

    for (name, url) in manifest.iter() {
        let icon = if clones.contains_key(name) { "📁" } else { "📥" };
        println!("  {} {} ({} artifacts)", icon, name, count_artifacts(config, name));
        println!("     🔗 {}", url);
        if let Some(Some(cloned_url)) = clones.get(name) {
            if cloned_url != url {
                println!("     ⚠️  Clone points at {}; it will be recreated", cloned_url);
            }
        }
    }

    for (name, url) in untracked {
        println!(
            "  📌 {} ({} artifacts) - tracked, not in repository list",
            name,
            count_artifacts(config, name)
        );
        println!("     🔗 {}", url.as_deref().unwrap_or("remote unknown"));
    }

    Ok(())
}

fn count_artifacts(config: &Config, name: &str) -> usize {
    std::fs::read_dir(config.difference_dir().join(name))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
        .unwrap_or(0)
}

/// Parse a patch file and print the artifact JSON
fn cmd_parse(patch: &std::path::Path, hash: Option<String>, subject: Option<String>) -> Result<()> {
    let text = std::fs::read_to_string(patch)
        .with_context(|| format!("Failed to read patch file {}", patch.display()))?;

    let header = text.lines().next().unwrap_or_default();
    let (header_hash, header_subject) = header.split_once(' ').unwrap_or((header, ""));

    let record = DiffRecord::from_patch(
        hash.unwrap_or_else(|| header_hash.to_string()),
        subject.unwrap_or_else(|| header_subject.to_string()),
        &text,
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("Failed to serialize diff")?
    );
    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 diffwatch System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
