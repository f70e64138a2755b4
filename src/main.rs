use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use syncreeper::config::LoggingConfig;
use syncreeper::lock::{self, LockStatus};
use syncreeper::{
    Config, GitHubClient, HealthCheck, MirrorReconciler, RunOutcome, SyncEngine, SyncOptions,
    SyncSummary,
};

#[derive(Parser)]
#[command(name = "syncreeper")]
#[command(about = "Mirror every GitHub repository you can access onto this host")]
#[command(version)]
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
    /// Write configuration and create the mirror root
    Init {
        /// Root directory for repository mirrors
        #[arg(short, long, default_value = "~/repos")]
        repos_path: String,
    },

    /// Run one synchronization pass
    Sync {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,

        /// Suppress per-repository progress lines
        #[arg(short, long)]
        quiet: bool,
    },

    /// List repositories that would be mirrored
    List {
        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// Show lock and mirror status
    Status,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // init may be asked to create the file it would otherwise load
    let config = match (&cli.command, cli.config.as_deref()) {
        (Commands::Init { .. }, Some(path)) if !path.exists() => Config::default(),
        (_, path) => load_config(path)?,
    };
    init_logging(&config.logging, cli.verbose);
    info!("Starting syncreeper v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { repos_path } => cmd_init(repos_path, cli.config.as_deref()),
        Commands::Sync { json, quiet } => cmd_sync(json, quiet, &config).await,
        Commands::List { details } => cmd_list(details, &config).await,
        Commands::Status => cmd_status(&config),
        Commands::Doctor => Ok(cmd_doctor(&config)),
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color);

    if logging.format == "full" {
        tracing_subscriber::registry().with(layer).with(filter).init();
    } else {
        tracing_subscriber::registry()
            .with(layer.compact())
            .with(filter)
            .init();
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn cmd_init(repos_path: String, config_path: Option<&Path>) -> Result<ExitCode> {
    info!("Initializing syncreeper...");

    let expanded = shellexpand::full(&repos_path)
        .context("Failed to expand repos path")?
        .into_owned();
    std::fs::create_dir_all(&expanded)
        .with_context(|| format!("Failed to create mirror root {}", expanded))?;

    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    // Edit the file as written so `${VAR}` references stay unexpanded on disk
    let mut new_config = if config_path.exists() {
        Config::read(&config_path)?
    } else {
        Config::default()
    };
    new_config.paths.repos_path = repos_path;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    new_config.save(&config_path)?;

    println!("✅ syncreeper initialized");
    println!("   Config: {}", config_path.display());
    println!("   Mirror root: {}", expanded);
    new_config.expand_paths()?;
    println!("   Lock directory: {}", new_config.lock_dir().display());
    println!("   Next: export GITHUB_TOKEN (or run 'gh auth login') and run 'syncreeper sync'");

    Ok(ExitCode::SUCCESS)
}

async fn cmd_sync(json: bool, quiet: bool, config: &Config) -> Result<ExitCode> {
    let stale_timeout = config.stale_timeout()?;
    let run_timeout = config.run_timeout()?;
    let mirror_root = config.repos_path();

    std::fs::create_dir_all(&mirror_root)
        .with_context(|| format!("Failed to create mirror root {}", mirror_root.display()))?;

    let (client, token) = GitHubClient::from_config(config).await?;
    let engine = SyncEngine::with_reconciler(
        SyncOptions {
            mirror_root,
            credential: token,
            progress: config.sync.progress && !quiet && !json,
        },
        MirrorReconciler::new(config.sync.max_git_processes),
    );

    let lock_dir = config.lock_dir();
    let run = engine.run(&client, &lock_dir, stale_timeout);

    // Dropping the run future releases the sync lock
    let outcome = tokio::select! {
        result = tokio::time::timeout(run_timeout, run) => match result {
            Ok(outcome) => outcome?,
            Err(_) => bail!("Sync run exceeded {}s and was cancelled", run_timeout.as_secs()),
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, sync run cancelled");
            return Ok(ExitCode::from(130));
        }
    };

    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::Skipped { reason } => {
            if json {
                println!("{}", serde_json::json!({ "skipped": true, "reason": reason }));
            } else {
                println!("⏭️  {}", reason);
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
    } else {
        print_summary(&summary);
    }

    if summary.has_errors() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_summary(summary: &SyncSummary) {
    println!("\n🎉 Synchronization Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   📥 Cloned: {}", summary.cloned);
    println!("   🔄 Updated: {}", summary.updated);
    println!("   ✅ Unchanged: {}", summary.unchanged);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.has_errors() {
        println!("\n🔍 Failed Repositories:");
        for result in summary.errors() {
            println!("   ❌ {}: {}", result.repository, result.message);
        }
    }
}

async fn cmd_list(details: bool, config: &Config) -> Result<ExitCode> {
    let (client, _token) = GitHubClient::from_config(config).await?;
    let repositories = client.list_user_repositories().await?;
    let mirror_root = config.repos_path();

    println!("Repositories ({}):", repositories.len());
    for repo in repositories {
        if details {
            let visibility = if repo.is_private { "private" } else { "public" };
            let mirrored = repo.mirror_path(&mirror_root).join(".git").exists();
            println!("📁 {}", repo.full_name);
            println!("   🔒 {} · branch {}", visibility, repo.default_branch);
            println!("   🔗 {}", repo.clone_url);
            println!("   💾 {}", if mirrored { "mirrored" } else { "not yet mirrored" });
            println!();
        } else {
            println!("  📁 {}", repo.full_name);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_status(config: &Config) -> Result<ExitCode> {
    let lock_dir = config.lock_dir();
    let mirror_root = config.repos_path();

    println!("📊 syncreeper status");
    match lock::lock_status(&lock_dir, config.stale_timeout()?)? {
        LockStatus::Unlocked => println!("   🟢 No sync running"),
        LockStatus::Held { pid, age } => println!(
            "   🔄 Sync running (PID {}, {}s)",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            age.as_secs()
        ),
        LockStatus::Stale { pid, age } => println!(
            "   ⚠️  Stale lock (PID {}, {}s old); next run reclaims it",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            age.as_secs()
        ),
    }
    println!("   🔐 Lock directory: {}", lock_dir.display());
    println!("   📁 Mirror root: {}", mirror_root.display());
    println!("   💾 Mirrors: {}", count_mirrors(&mirror_root));
    println!("   ⏰ Scheduled by: {}", config.service.name);
    println!("   💡 Inspect with: {}", config.service.status_command);

    Ok(ExitCode::SUCCESS)
}

/// Count `<root>/<owner>/<repo>/.git` directories
fn count_mirrors(root: &Path) -> usize {
    let Ok(owners) = std::fs::read_dir(root) else {
        return 0;
    };

    owners
        .filter_map(|entry| entry.ok())
        .filter_map(|owner| std::fs::read_dir(owner.path()).ok())
        .flat_map(|repos| repos.filter_map(|entry| entry.ok()))
        .filter(|repo| repo.path().join(".git").is_dir())
        .count()
}

fn cmd_doctor(config: &Config) -> ExitCode {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    if health.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    println!("🔍 syncreeper System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
        println!();
    }

    let errors = health.errors();
    let warnings = health.warnings();
    if errors.is_empty() {
        println!("✅ All checks passed ({} warning(s))", warnings.len());
    } else {
        println!("❌ {} check(s) failed:", errors.len());
        for failed in errors {
            println!("   • {}", failed.message);
        }
    }
}
