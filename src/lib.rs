//! syncreeper - Repository Mirror Synchronization Engine
//!
//! Keeps a local, read-only mirror of every GitHub repository a user can
//! access. Each pass lists repositories from the provider, then reconciles
//! each mirror in turn: clone when absent, force-reset to the origin's default
//! branch when behind, leave alone when current. A crash-safe lock file makes
//! sure only one pass runs per host.
//!
//! ## Modules
//!
//! - [`github`]: provider client listing non-archived repositories
//! - [`git`]: mirror reconciler (clone / update / unchanged)
//! - [`lock`]: cross-process sync lock with stale reclamation
//! - [`sync`]: sequential driver and run summaries
//! - [`config`]: YAML configuration with XDG defaults
//! - [`health`]: preflight diagnostics

pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod health;
pub mod lock;
pub mod sync;

pub use config::Config;
pub use error::{LockError, ProviderError, SyncError};
pub use git::{MirrorReconciler, SyncAction, SyncResult};
pub use github::{GitHubClient, Repository, RepositoryProvider};
pub use health::HealthCheck;
pub use lock::{LockAcquisition, LockStatus, SyncLock};
pub use sync::{RunOutcome, SyncEngine, SyncOptions, SyncSummary};
