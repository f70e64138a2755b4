use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::github::Repository;

const REDACTED: &str = "***";

/// Outcome kind of reconciling one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Cloned,
    Updated,
    Unchanged,
    Error,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Updated => "updated",
            SyncAction::Unchanged => "unchanged",
            SyncAction::Error => "error",
        };
        f.write_str(label)
    }
}

/// Result of reconciling one repository against its mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Owner-qualified repository name
    pub repository: String,
    pub action: SyncAction,
    /// Human-readable detail; the failure cause for `error`
    pub message: String,
    /// Commits the mirror advanced by, for `updated`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits_advanced: Option<u32>,
}

impl SyncResult {
    pub fn cloned(repository: &str) -> Self {
        Self::new(repository, SyncAction::Cloned, "Cloned successfully".to_string())
    }

    pub fn updated(repository: &str, commits: u32) -> Self {
        let mut result = Self::new(
            repository,
            SyncAction::Updated,
            format!("Updated ({} commit{} behind)", commits, if commits == 1 { "" } else { "s" }),
        );
        result.commits_advanced = Some(commits);
        result
    }

    pub fn unchanged(repository: &str) -> Self {
        Self::new(repository, SyncAction::Unchanged, "Already up to date".to_string())
    }

    pub fn error(repository: &str, message: impl Into<String>) -> Self {
        Self::new(repository, SyncAction::Error, message.into())
    }

    fn new(repository: &str, action: SyncAction, message: String) -> Self {
        Self {
            repository: repository.to_string(),
            action,
            message,
            commits_advanced: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.action == SyncAction::Error
    }
}

/// Failure inside the update sequence, remembering whether `origin` may
/// currently carry the credential
struct UpdateFailure {
    error: anyhow::Error,
    origin_authenticated: bool,
}

/// Clones and force-updates local mirrors with the `git` binary.
///
/// The credential only ever lives in `origin` for the duration of one network
/// operation; at rest every mirror points at its unauthenticated clone URL.
#[derive(Clone)]
pub struct MirrorReconciler {
    git_permits: Arc<Semaphore>,
}

impl Default for MirrorReconciler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MirrorReconciler {
    /// Create a reconciler allowing `max_git_processes` subprocesses in flight
    pub fn new(max_git_processes: usize) -> Self {
        Self {
            git_permits: Arc::new(Semaphore::new(max_git_processes.max(1))),
        }
    }

    /// Bring the mirror of `repo` under `mirror_root` in line with its origin.
    ///
    /// Never fails: every failure mode becomes an `error` result.
    pub async fn reconcile(&self, repo: &Repository, mirror_root: &Path, credential: &str) -> SyncResult {
        let target = repo.mirror_path(mirror_root);

        let result = if target.join(".git").exists() {
            self.update_mirror(repo, &target, credential).await
        } else {
            self.clone_mirror(repo, &target, credential).await
        };

        // Messages include git stderr, which may echo the authenticated URL
        SyncResult {
            message: redact(&result.message, credential),
            ..result
        }
    }

    async fn clone_mirror(&self, repo: &Repository, target: &Path, credential: &str) -> SyncResult {
        info!("Cloning repository: {} -> {}", repo.full_name, target.display());

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return SyncResult::error(
                    &repo.full_name,
                    format!("Failed to create parent directory {}: {}", parent.display(), e),
                );
            }
        }

        let auth_url = match authenticated_url(&repo.clone_url, credential) {
            Ok(url) => url,
            Err(e) => return SyncResult::error(&repo.full_name, format!("{:#}", e)),
        };

        // Armed until git has finished: a cancelled clone must not leave a
        // half-written `.git` whose origin carries the credential
        let mut partial = PartialClone::new(target);
        let target_arg = target.to_string_lossy();
        let clone = self
            .git(
                None,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    &repo.default_branch,
                    &auth_url,
                    &target_arg,
                ],
            )
            .await;
        partial.disarm();
        if let Err(e) = clone {
            return SyncResult::error(&repo.full_name, format!("Clone failed: {:#}", e));
        }

        let mut restore = OriginRestore::new(target, &repo.clone_url);
        let rewritten = self.set_origin(target, &repo.clone_url).await;
        restore.disarm();
        if let Err(e) = rewritten {
            error!(
                repository = %repo.full_name,
                "Cloned mirror still carries the credential in its origin URL"
            );
            return SyncResult::error(
                &repo.full_name,
                format!("Cloned, but failed to remove the credential from origin: {:#}", e),
            );
        }

        info!("Successfully cloned: {}", repo.full_name);
        SyncResult::cloned(&repo.full_name)
    }

    async fn update_mirror(&self, repo: &Repository, target: &Path, credential: &str) -> SyncResult {
        debug!("Updating mirror: {} at {}", repo.full_name, target.display());

        // Covers cancellation anywhere in the sequence below, including the
        // asynchronous cleanup after a failure
        let mut restore = OriginRestore::new(target, &repo.clone_url);

        let result = match self.fetch_and_reset(repo, target, credential).await {
            Ok(0) => SyncResult::unchanged(&repo.full_name),
            Ok(behind) => {
                info!("Updated {} by {} commits", repo.full_name, behind);
                SyncResult::updated(&repo.full_name, behind)
            }
            Err(failure) => {
                let mut message = format!("Update failed: {:#}", failure.error);
                if failure.origin_authenticated {
                    // Best effort: never let this mask the original cause
                    if let Err(cleanup) = self.set_origin(target, &repo.clone_url).await {
                        error!(
                            repository = %repo.full_name,
                            "Failed to restore unauthenticated origin URL: {}",
                            redact(&format!("{:#}", cleanup), credential)
                        );
                        message.push_str(
                            " (origin URL could not be restored and may still contain the credential)",
                        );
                    }
                }
                warn!(repository = %repo.full_name, "{}", redact(&message, credential));
                SyncResult::error(&repo.full_name, message)
            }
        };

        restore.disarm();
        result
    }

    /// Fetch the default branch with the credential in place, reset if behind,
    /// restore `origin`. Returns the number of commits the mirror advanced.
    async fn fetch_and_reset(
        &self,
        repo: &Repository,
        target: &Path,
        credential: &str,
    ) -> std::result::Result<u32, UpdateFailure> {
        let before_auth = |error| UpdateFailure {
            error,
            origin_authenticated: false,
        };
        let with_auth = |error| UpdateFailure {
            error,
            origin_authenticated: true,
        };

        let auth_url = authenticated_url(&repo.clone_url, credential).map_err(before_auth)?;
        self.set_origin(target, &auth_url).await.map_err(with_auth)?;

        let branch = &repo.default_branch;
        let remote_ref = format!("origin/{}", branch);
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);

        self.git(Some(target), &["fetch", "--depth", "1", "origin", &refspec])
            .await
            .context("Fetch failed")
            .map_err(with_auth)?;

        let behind = self
            .commits_behind(target, &remote_ref)
            .await
            .map_err(with_auth)?;

        if behind > 0 {
            self.git(Some(target), &["reset", "--hard", &remote_ref])
                .await
                .context("Reset failed")
                .map_err(with_auth)?;
        }

        self.set_origin(target, &repo.clone_url)
            .await
            .context("Failed to restore unauthenticated origin URL")
            .map_err(with_auth)?;

        Ok(behind)
    }

    async fn commits_behind(&self, path: &Path, remote_ref: &str) -> Result<u32> {
        let range = format!("HEAD..{}", remote_ref);
        let output = self
            .git(Some(path), &["rev-list", "--count", &range])
            .await
            .context("Failed to count commits behind remote")?;

        output
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Unexpected rev-list output: {:?}", output.trim()))
    }

    async fn set_origin(&self, path: &Path, url: &str) -> Result<()> {
        self.git(Some(path), &["remote", "set-url", "origin", url])
            .await
            .map(|_| ())
    }

    /// Read the `origin` URL of the mirror at `path`
    pub async fn origin_url(&self, path: &Path) -> Result<String> {
        self.git(Some(path), &["remote", "get-url", "origin"])
            .await
            .map(|url| url.trim().to_string())
    }

    /// Run one git subprocess, holding a permit for its whole lifetime
    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String> {
        let _permit = self
            .git_permits
            .acquire()
            .await
            .map_err(|_| anyhow!("git process limiter closed"))?;

        let mut command = AsyncCommand::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Puts the unauthenticated origin URL back if dropped while armed.
///
/// Reconciliation futures are dropped mid-sequence by caller timeouts and
/// Ctrl-C; `kill_on_drop` ends the git child, so the restore has to happen
/// synchronously here.
struct OriginRestore {
    path: PathBuf,
    url: String,
    armed: bool,
}

impl OriginRestore {
    fn new(path: &Path, url: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            url: url.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for OriginRestore {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Reconcile cancelled, restoring origin URL of {}", self.path.display());
        let status = std::process::Command::new("git")
            .args(["remote", "set-url", "origin", &self.url])
            .current_dir(&self.path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => error!(
                "Failed to restore origin URL of {} ({}); it may still contain the credential",
                self.path.display(),
                status
            ),
            Err(e) => error!(
                "Failed to restore origin URL of {}: {}; it may still contain the credential",
                self.path.display(),
                e
            ),
        }
    }
}

/// Removes what a clone created if dropped while the clone is still running.
///
/// A target directory that existed beforehand keeps everything but `.git`.
struct PartialClone {
    target: PathBuf,
    existed: bool,
    armed: bool,
}

impl PartialClone {
    fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            existed: target.exists(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialClone {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let doomed = if self.existed {
            self.target.join(".git")
        } else {
            self.target.clone()
        };
        warn!("Clone cancelled, removing partial mirror {}", doomed.display());

        // The killed git child may still be exiting and writing files
        let mut last_error = None;
        for _ in 0..5 {
            match std::fs::remove_dir_all(&doomed) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    last_error = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
            }
        }
        if let Some(e) = last_error {
            error!(
                "Failed to remove partial mirror {}: {}; its origin may contain the credential",
                doomed.display(),
                e
            );
        }
    }
}

/// Embed `credential` as the user-info of an HTTP(S) clone URL.
///
/// Other schemes (`file://`, local paths, ssh) carry no user-info and are
/// returned unchanged.
pub fn authenticated_url(clone_url: &str, credential: &str) -> Result<String> {
    let mut url = match Url::parse(clone_url) {
        Ok(url) => url,
        Err(_) => return Ok(clone_url.to_string()),
    };

    if !matches!(url.scheme(), "http" | "https") || credential.is_empty() {
        return Ok(clone_url.to_string());
    }

    url.set_username(credential)
        .map_err(|_| anyhow!("Cannot embed credential in clone URL"))?;
    url.set_password(None)
        .map_err(|_| anyhow!("Cannot embed credential in clone URL"))?;
    Ok(url.to_string())
}

/// Whether `url` carries a user-info component
pub fn has_credential(url: &str) -> bool {
    Url::parse(url)
        .map(|url| !url.username().is_empty() || url.password().is_some())
        .unwrap_or(false)
}

/// Replace every occurrence of `credential` in `text`
pub fn redact(text: &str, credential: &str) -> String {
    if credential.is_empty() {
        text.to_string()
    } else {
        text.replace(credential, REDACTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_authenticated_url_embeds_token() {
        let url = authenticated_url("https://github.com/octocat/Hello-World.git", "ghp_secret").unwrap();
        assert_eq!(url, "https://ghp_secret@github.com/octocat/Hello-World.git");
        assert!(has_credential(&url));
    }

    #[test]
    fn test_authenticated_url_replaces_existing_userinfo() {
        let url = authenticated_url("https://old:pw@github.com/acme/tools.git", "ghp_new").unwrap();
        assert_eq!(url, "https://ghp_new@github.com/acme/tools.git");
    }

    #[test]
    fn test_non_http_urls_pass_through() {
        for url in [
            "file:///srv/remotes/tools.git",
            "git@github.com:acme/tools.git",
            "/srv/remotes/tools.git",
        ] {
            assert_eq!(authenticated_url(url, "ghp_secret").unwrap(), url);
            assert!(!has_credential(url));
        }
    }

    #[test]
    fn test_empty_credential_leaves_url_alone() {
        let url = "https://github.com/acme/tools.git";
        assert_eq!(authenticated_url(url, "").unwrap(), url);
    }

    #[test]
    fn test_sync_result_constructors() {
        let updated = SyncResult::updated("acme/tools", 3);
        assert_eq!(updated.action, SyncAction::Updated);
        assert_eq!(updated.commits_advanced, Some(3));
        assert_eq!(updated.message, "Updated (3 commits behind)");
        assert_eq!(SyncResult::updated("acme/tools", 1).message, "Updated (1 commit behind)");

        let failed = SyncResult::error("acme/tools", "boom");
        assert!(failed.is_error());
        assert!(!SyncResult::unchanged("acme/tools").is_error());
    }

    #[test]
    fn test_sync_result_serializes_lowercase_action() {
        let json = serde_json::to_value(SyncResult::cloned("acme/tools")).unwrap();
        assert_eq!(json["action"], "cloned");
        assert_eq!(json["repository"], "acme/tools");
        assert!(json.get("commits_advanced").is_none());
    }

    #[test]
    fn test_redact_hides_credential_in_git_errors() {
        let stderr = "fatal: unable to access 'https://ghp_secret@github.com/acme/tools.git/': 403";
        let redacted = redact(stderr, "ghp_secret");
        assert!(!redacted.contains("ghp_secret"));
        assert!(redacted.contains("https://***@github.com"));
    }

    #[quickcheck]
    fn prop_redacted_text_never_contains_token(prefix: String, suffix: String) -> bool {
        let token = "ghp_0123456789abcdef";
        let text = format!("{}{}{}", prefix, token, suffix);
        !redact(&text, token).contains(token)
    }

    #[tokio::test]
    async fn test_clone_failure_is_captured_as_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("does-not-exist.git");
        let repo = Repository {
            name: "ghost".to_string(),
            full_name: "acme/ghost".to_string(),
            clone_url: Url::from_file_path(&missing).unwrap().to_string(),
            ssh_url: None,
            is_private: false,
            is_archived: false,
            default_branch: "main".to_string(),
        };

        let result = MirrorReconciler::default()
            .reconcile(&repo, &tmp.path().join("mirrors"), "ghp_secret")
            .await;

        assert_eq!(result.action, SyncAction::Error);
        assert!(result.message.starts_with("Clone failed"));
        assert!(!tmp.path().join("mirrors/acme/ghost/.git").exists());
    }
}
