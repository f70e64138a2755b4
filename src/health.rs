//! Preflight checks for syncreeper
//!
//! Verifies the host can run a synchronization pass: git is installed, a
//! credential can be found, the mirror root exists and the sync lock is free.

use crate::github::detect_authentication;
use crate::lock::{self, LockStatus};
use crate::Config;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// GitHub credential availability
    pub credential: CheckResult,
    /// Mirror root status
    pub repos_path: CheckResult,
    /// Sync lock status (warning only)
    pub lock: CheckResult,
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
            git: Self::check_git(),
            credential: Self::check_credential(config),
            repos_path: Self::check_repos_path(config),
            lock: Self::check_lock(config),
        }
    }

    /// Check if all required checks passed (warnings do not count)
    pub fn all_passed(&self) -> bool {
        self.errors().is_empty()
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        [&self.git, &self.credential, &self.repos_path, &self.lock]
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        [&self.git, &self.credential, &self.repos_path, &self.lock]
            .into_iter()
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(output) => CheckResult::error_with_details(
                "Git command failed",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Credential discovery only; no API call is made
    fn check_credential(config: &Config) -> CheckResult {
        match detect_authentication(config) {
            Ok((strategy, _)) => {
                CheckResult::ok_with_details("GitHub credential found", format!("Source: {:?}", strategy))
            }
            Err(e) => CheckResult::error_with_details("No GitHub credential", e.to_string()),
        }
    }

    fn check_repos_path(config: &Config) -> CheckResult {
        let path = config.repos_path();
        if path.is_dir() {
            CheckResult::ok_with_details("Mirror root exists", path.display().to_string())
        } else {
            CheckResult::error_with_details(
                "Mirror root does not exist",
                format!("Run: mkdir -p {}", path.display()),
            )
        }
    }

    fn check_lock(config: &Config) -> CheckResult {
        let lock_dir = config.lock_dir();
        let stale_timeout = config.stale_timeout().unwrap_or(lock::DEFAULT_STALE_TIMEOUT);

        match lock::lock_status(&lock_dir, stale_timeout) {
            Ok(LockStatus::Unlocked) => CheckResult::ok_with_details("Sync lock free", lock_dir.display().to_string()),
            Ok(LockStatus::Held { pid, age }) => CheckResult::warning_with_details(
                "A sync run is in progress",
                format!("Owner PID: {}, held for {}s", describe_pid(pid), age.as_secs()),
            ),
            Ok(LockStatus::Stale { pid, age }) => CheckResult::warning_with_details(
                "Stale sync lock found",
                format!(
                    "Owner PID: {}, last refreshed {}s ago; the next run reclaims it",
                    describe_pid(pid),
                    age.as_secs()
                ),
            ),
            Err(e) => CheckResult::error_with_details("Cannot inspect sync lock", e.to_string()),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("GitHub Credential", &self.credential),
            ("Mirror Root", &self.repos_path),
            ("Sync Lock", &self.lock),
        ]
    }
}

fn describe_pid(pid: Option<u32>) -> String {
    match pid {
        Some(pid) if lock::owner_alive(pid) => format!("{} (running)", pid),
        Some(pid) => format!("{} (not running)", pid),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn passing() -> HealthCheck {
        HealthCheck {
            git: CheckResult::ok("Git OK"),
            credential: CheckResult::ok("Credential OK"),
            repos_path: CheckResult::ok("Dir OK"),
            lock: CheckResult::ok("Lock OK"),
        }
    }

    #[test]
    fn test_check_result_warning_still_passes() {
        let result = CheckResult::warning_with_details("Test warning", "Warning details");
        assert!(result.passed);
        assert!(result.is_warning);
        assert_eq!(result.details, Some("Warning details".to_string()));
    }

    #[test]
    fn test_check_result_error_with_details() {
        let result = CheckResult::error_with_details("Test failed", "Error details");
        assert!(!result.passed);
        assert!(!result.is_warning);
    }

    #[test]
    fn test_git_check() {
        let result = HealthCheck::check_git();
        assert!(result.passed);
        assert!(result.details.is_some());
    }

    #[test]
    fn test_check_repos_path() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();

        config.paths.repos_path = tmp.path().display().to_string();
        assert!(HealthCheck::check_repos_path(&config).passed);

        config.paths.repos_path = tmp.path().join("missing").display().to_string();
        let result = HealthCheck::check_repos_path(&config);
        assert!(!result.passed);
        assert!(result.details.unwrap().starts_with("Run: mkdir -p"));
    }

    #[tokio::test]
    async fn test_check_lock_warns_while_held() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.lock_dir = Some(tmp.path().display().to_string());

        assert!(!HealthCheck::check_lock(&config).is_warning);

        let _held = lock::acquire(tmp.path(), lock::DEFAULT_STALE_TIMEOUT).await.unwrap();
        let result = HealthCheck::check_lock(&config);
        assert!(result.passed);
        assert!(result.is_warning);
        assert!(result.details.unwrap().contains("(running)"));
    }

    #[test]
    fn test_lock_warning_does_not_fail_preflight() {
        let health = HealthCheck {
            lock: CheckResult::warning_with_details("A sync run is in progress", "PID 1"),
            ..passing()
        };
        assert!(health.all_passed());
        assert_eq!(health.warnings().len(), 1);
        assert!(health.errors().is_empty());
    }

    #[test]
    fn test_errors_returns_only_errors() {
        let health = HealthCheck {
            git: CheckResult::error_with_details("Git error", "missing"),
            repos_path: CheckResult::error_with_details("Dir error", "missing"),
            ..passing()
        };
        assert!(!health.all_passed());
        assert_eq!(health.errors().len(), 2);
    }

    #[test]
    fn test_all_checks_returns_all_four() {
        let health = passing();
        let names: Vec<_> = health.all_checks().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["Git Installation", "GitHub Credential", "Mirror Root", "Sync Lock"]
        );
    }
}
