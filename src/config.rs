use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for syncreeper
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub authentication settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Mirror root and lock locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Service wiring used by status reporting
    #[serde(default)]
    pub service: ServiceConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// GitHub username (auto-detected if null)
    pub username: Option<String>,

    /// Personal access token; `${VAR}` references are expanded at load time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Filesystem locations
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    /// Root directory holding `<owner>/<repo>` mirrors
    #[serde(default = "default_repos_path")]
    pub repos_path: String,

    /// Directory for the sync lock file (parent of `repos_path` if null)
    #[serde(default)]
    pub lock_dir: Option<String>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Age after which a held lock is presumed abandoned
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout: String, // "10m"

    /// Upper bound for a complete synchronization run
    #[serde(default = "default_run_timeout")]
    pub run_timeout: String, // "1h"

    /// Print per-repository progress to stdout
    #[serde(default = "default_true")]
    pub progress: bool,

    /// Git subprocesses allowed in flight per reconciler
    #[serde(default = "default_max_git_processes")]
    pub max_git_processes: usize,
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

/// Platform-specific service wiring, resolved once when the config is built
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Name of the scheduled unit that triggers sync runs
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Command an operator runs to inspect the scheduled unit
    #[serde(default = "default_status_command")]
    pub status_command: String,
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_true() -> bool {
    true
}
fn default_repos_path() -> String {
    "${HOME}/repos".to_string()
}
fn default_stale_timeout() -> String {
    "10m".to_string()
}
fn default_run_timeout() -> String {
    "1h".to_string()
}
fn default_max_git_processes() -> usize {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

#[cfg(target_os = "macos")]
fn default_service_name() -> String {
    "com.syncreeper.sync".to_string()
}
#[cfg(not(target_os = "macos"))]
fn default_service_name() -> String {
    "syncreeper-sync.timer".to_string()
}

#[cfg(target_os = "macos")]
fn default_status_command() -> String {
    "launchctl list com.syncreeper.sync".to_string()
}
#[cfg(not(target_os = "macos"))]
fn default_status_command() -> String {
    "sudo systemctl status syncreeper-sync.timer".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            username: None,
            token: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repos_path: default_repos_path(),
            lock_dir: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_timeout: default_stale_timeout(),
            run_timeout: default_run_timeout(),
            progress: default_true(),
            max_git_processes: default_max_git_processes(),
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

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            status_command: default_status_command(),
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

            tracing::info!("Created default configuration at: {:?}", config_path);
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Parse a configuration file as written, without expanding variables
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
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

        Ok(config_dir.join("syncreeper").join("config.yml"))
    }

    /// Expand environment variables in configuration paths and the token
    pub fn expand_paths(&mut self) -> Result<()> {
        self.paths.repos_path = shellexpand::full(&self.paths.repos_path)
            .context("Failed to expand repos_path")?
            .into_owned();

        if let Some(lock_dir) = &self.paths.lock_dir {
            self.paths.lock_dir = Some(
                shellexpand::full(lock_dir)
                    .context("Failed to expand lock_dir")?
                    .into_owned(),
            );
        }

        if let Some(token) = &self.github.token {
            self.github.token = Some(
                shellexpand::env(token)
                    .context("Failed to expand github.token")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Mirror root, normalized
    pub fn repos_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.repos_path).clean()
    }

    /// Directory holding the sync lock; defaults to the mirror root's parent
    pub fn lock_dir(&self) -> PathBuf {
        match &self.paths.lock_dir {
            Some(dir) => PathBuf::from(dir).clean(),
            None => {
                let repos = self.repos_path();
                repos
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or(repos)
            }
        }
    }

    pub fn stale_timeout(&self) -> Result<Duration> {
        parse_duration(&self.sync.stale_timeout)
            .map(Duration::from_secs)
            .context("Invalid sync.stale_timeout")
    }

    pub fn run_timeout(&self) -> Result<Duration> {
        parse_duration(&self.sync.run_timeout)
            .map(Duration::from_secs)
            .context("Invalid sync.run_timeout")
    }
}

/// Parse duration strings like "30s", "10m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();
    if duration_str.is_empty() {
        return Err(anyhow!("Empty duration"));
    }

    if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")
    }
}
