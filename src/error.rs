//! Error kinds surfaced at the engine's public boundaries
//!
//! Repository-level failures never appear here: the reconciler turns them into
//! [`SyncResult`](crate::git::SyncResult) values. Lock contention is not an error
//! either, see [`LockAcquisition`](crate::lock::LockAcquisition).

use std::path::PathBuf;
use thiserror::Error;

/// Failure while listing repositories from the hosting provider.
///
/// Fatal to the whole run: there is no per-repository granularity before the
/// list exists. Never retried internally.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No token could be found for the configured auth method
    #[error("no GitHub credential available: {0}")]
    MissingCredential(String),

    /// The provider rejected the credential (HTTP 401/403)
    #[error("GitHub rejected the credential (HTTP {status}): {message}")]
    Authentication { status: u16, message: String },

    /// Resolving the authenticated user's login failed
    #[error("failed to look up the authenticated GitHub user: {0}")]
    UserLookup(#[source] octocrab::Error),

    /// Network or API failure while paging through repositories
    #[error("failed to list repositories (page {page}): {source}")]
    Request {
        page: u32,
        #[source]
        source: octocrab::Error,
    },

    /// The HTTP client itself could not be constructed
    #[error("failed to create GitHub client: {0}")]
    Client(#[source] octocrab::Error),
}

/// I/O failure preparing the lock directory or its marker.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to create lock directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a complete synchronization pass
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Lock(#[from] LockError),
}
