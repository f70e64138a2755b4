//! GitHub provider client
//!
//! Produces the complete, de-paginated list of non-archived repositories a
//! credential can see. Archived and private totals are logged for operators
//! but never returned.

use async_trait::async_trait;
use octocrab::{Octocrab, Page};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProviderError;

const PER_PAGE: u8 = 100;
const DEFAULT_BRANCH: &str = "main";

/// A repository the engine mirrors. Never archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub name: String,
    /// Owner-qualified name, e.g. `octocat/Hello-World`
    pub full_name: String,
    /// Unauthenticated HTTPS clone URL
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub is_private: bool,
    pub is_archived: bool,
    pub default_branch: String,
}

impl Repository {
    /// Owner segment of `full_name`
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(&self.full_name)
    }

    /// Local mirror location: `<root>/<owner>/<repo>`
    pub fn mirror_path(&self, root: &Path) -> PathBuf {
        match self.full_name.split_once('/') {
            Some((owner, name)) => root.join(owner).join(name),
            None => root.join(&self.name),
        }
    }

    fn from_github(repo: octocrab::models::Repository) -> Self {
        let full_name = repo.full_name.unwrap_or_else(|| repo.name.clone());
        let clone_url = repo
            .clone_url
            .map(|url| url.to_string())
            .unwrap_or_else(|| format!("https://github.com/{}.git", full_name));

        Self {
            name: repo.name,
            full_name,
            clone_url,
            ssh_url: repo.ssh_url,
            is_private: repo.private.unwrap_or(false),
            is_archived: false,
            default_branch: repo
                .default_branch
                .filter(|branch| !branch.is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        }
    }
}

/// Source of repositories for a synchronization run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Every non-archived repository visible to the credential, in provider order
    async fn list_repositories(&self) -> Result<Vec<Repository>, ProviderError>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// GitHub authentication strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Token from the configuration file
    ConfigToken,
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

/// Query parameters for `GET /user/repos`
#[derive(Serialize)]
struct ListReposParams<'a> {
    visibility: &'a str,
    affiliation: &'a str,
    sort: &'a str,
    direction: &'a str,
    per_page: u8,
    page: u32,
}

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    client: Octocrab,
    username: String,
}

impl GitHubClient {
    /// Create a client from configuration, discovering the credential
    pub async fn from_config(config: &Config) -> Result<(Self, String), ProviderError> {
        let (strategy, token) = detect_authentication(config)?;
        info!("Using authentication strategy: {:?}", strategy);

        let client = Self::new(&token, config.github.username.clone()).await?;
        Ok((client, token))
    }

    /// Create a client for `token`; resolves the username when not given
    pub async fn new(token: &str, username: Option<String>) -> Result<Self, ProviderError> {
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .map_err(ProviderError::Client)?;

        Self::with_client(client, username).await
    }

    /// Create a client against a non-default API root (GitHub Enterprise, test servers)
    pub async fn with_base_uri(
        token: &str,
        username: Option<String>,
        base_uri: &str,
    ) -> Result<Self, ProviderError> {
        let client = Octocrab::builder()
            .base_uri(base_uri)
            .map_err(ProviderError::Client)?
            .personal_token(token.to_string())
            .build()
            .map_err(ProviderError::Client)?;

        Self::with_client(client, username).await
    }

    async fn with_client(client: Octocrab, username: Option<String>) -> Result<Self, ProviderError> {
        let username = match username {
            Some(username) => username,
            None => {
                let user = client
                    .current()
                    .user()
                    .await
                    .map_err(|e| classify_error(e, None))?;
                user.login
            }
        };

        info!("Authenticated as GitHub user: {}", username);
        Ok(Self { client, username })
    }

    /// Get the authenticated username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// List every repository the credential can access, dropping archived ones
    pub async fn list_user_repositories(&self) -> Result<Vec<Repository>, ProviderError> {
        debug!("Fetching repositories for: {}", self.username);

        let mut repositories = Vec::new();
        let mut archived = 0usize;
        let mut private = 0usize;
        let mut page = 1u32;

        loop {
            let params = ListReposParams {
                visibility: "all",
                affiliation: "owner,collaborator,organization_member",
                sort: "updated",
                direction: "desc",
                per_page: PER_PAGE,
                page,
            };

            let page_repos: Page<octocrab::models::Repository> = self
                .client
                .get("/user/repos", Some(&params))
                .await
                .map_err(|e| classify_error(e, Some(page)))?;

            let has_next = page_repos.next.is_some();
            let items = page_repos.items;
            if items.is_empty() {
                break;
            }

            for repo in items {
                if repo.archived.unwrap_or(false) {
                    archived += 1;
                    debug!("Skipping archived repository: {}", repo.name);
                    continue;
                }
                if repo.private.unwrap_or(false) {
                    private += 1;
                }
                repositories.push(Repository::from_github(repo));
            }

            if !has_next {
                break;
            }
            page += 1;
        }

        info!(
            "Found {} repositories for {} ({} private, {} archived skipped)",
            repositories.len(),
            self.username,
            private,
            archived
        );
        Ok(repositories)
    }
}

#[async_trait]
impl RepositoryProvider for GitHubClient {
    async fn list_repositories(&self) -> Result<Vec<Repository>, ProviderError> {
        self.list_user_repositories().await
    }

    fn provider_name(&self) -> &'static str {
        "GitHub"
    }
}

/// Split authentication rejections from every other request failure.
///
/// `page` is None for the authenticated-user lookup that precedes listing.
fn classify_error(error: octocrab::Error, page: Option<u32>) -> ProviderError {
    if let octocrab::Error::GitHub { source, .. } = &error {
        let status = source.status_code.as_u16();
        if status == 401 || status == 403 {
            return ProviderError::Authentication {
                status,
                message: source.message.clone(),
            };
        }
    }
    match page {
        Some(page) => ProviderError::Request { page, source: error },
        None => ProviderError::UserLookup(error),
    }
}

/// Detect and obtain a GitHub token according to `github.auth_method`
pub fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String), ProviderError> {
    match config.github.auth_method.as_str() {
        "auto" => {
            if let Some(token) = configured_token(config) {
                Ok((AuthStrategy::ConfigToken, token))
            } else if let Ok(token) = try_environment_token() {
                Ok((AuthStrategy::EnvironmentToken, token))
            } else if let Ok(token) = try_github_cli() {
                Ok((AuthStrategy::GitHubCLI, token))
            } else {
                Err(ProviderError::MissingCredential(
                    "set github.token in the config, export GITHUB_TOKEN, or run: gh auth login"
                        .to_string(),
                ))
            }
        }
        "gh_cli" => try_github_cli().map(|token| (AuthStrategy::GitHubCLI, token)),
        "token" => match configured_token(config) {
            Some(token) => Ok((AuthStrategy::ConfigToken, token)),
            None => try_environment_token().map(|token| (AuthStrategy::EnvironmentToken, token)),
        },
        other => Err(ProviderError::MissingCredential(format!(
            "unknown auth method: {}",
            other
        ))),
    }
}

fn configured_token(config: &Config) -> Option<String> {
    config
        .github
        .token
        .as_ref()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Try to get token from environment variable
fn try_environment_token() -> Result<String, ProviderError> {
    debug!("Attempting environment variable authentication");

    let token = env::var("GITHUB_TOKEN").map_err(|_| {
        ProviderError::MissingCredential("GITHUB_TOKEN environment variable not set".to_string())
    })?;
    let token = token.trim().to_string();

    if token.is_empty() {
        return Err(ProviderError::MissingCredential("GITHUB_TOKEN is empty".to_string()));
    }

    if !token.starts_with("ghp_") && !token.starts_with("gho_") && !token.starts_with("github_pat_") {
        warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_ or github_pat_ prefix)");
    }

    Ok(token)
}

/// Try to get token from GitHub CLI
fn try_github_cli() -> Result<String, ProviderError> {
    debug!("Attempting GitHub CLI authentication");

    let output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .map_err(|e| ProviderError::MissingCredential(format!("GitHub CLI (gh) unavailable: {}", e)))?;

    if !output.status.success() {
        return Err(ProviderError::MissingCredential(format!(
            "GitHub CLI is not authenticated: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(ProviderError::MissingCredential(
            "GitHub CLI returned empty token".to_string(),
        ));
    }

    debug!("Successfully obtained token from GitHub CLI");
    Ok(token)
}
