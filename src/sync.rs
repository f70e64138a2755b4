//! Sync Engine - Orchestrates a complete synchronization pass
//!
//! Repositories are reconciled one at a time, in the order the provider
//! returned them, to bound subprocess and network load on the host and the
//! provider. A failing repository yields an `error` result and the pass moves
//! on; only provider and lock-preparation failures abort a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::git::{MirrorReconciler, SyncAction, SyncResult};
use crate::github::{Repository, RepositoryProvider};
use crate::lock::{self, LockAcquisition};

/// Inputs of one synchronization pass
#[derive(Clone)]
pub struct SyncOptions {
    /// Root directory holding `<owner>/<repo>` mirrors
    pub mirror_root: PathBuf,
    /// Provider access token, embedded transiently into remote URLs
    pub credential: String,
    /// Print per-repository progress lines to stdout
    pub progress: bool,
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("mirror_root", &self.mirror_root)
            .field("credential", &"***")
            .field("progress", &self.progress)
            .finish()
    }
}

/// Results from a complete sync operation
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub total_repositories: usize,
    pub cloned: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub results: Vec<SyncResult>,
}

impl SyncSummary {
    /// Tally `results`, preserving their order
    pub fn from_results(results: Vec<SyncResult>, started_at: DateTime<Utc>, duration: Duration) -> Self {
        let count = |action: SyncAction| results.iter().filter(|r| r.action == action).count();

        Self {
            started_at,
            duration,
            total_repositories: results.len(),
            cloned: count(SyncAction::Cloned),
            updated: count(SyncAction::Updated),
            unchanged: count(SyncAction::Unchanged),
            failed: count(SyncAction::Error),
            results,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.failed > 0
    }

    pub fn errors(&self) -> impl Iterator<Item = &SyncResult> {
        self.results.iter().filter(|r| r.is_error())
    }
}

/// How a guarded run ended
#[derive(Debug)]
pub enum RunOutcome {
    Completed(SyncSummary),
    /// Another run held the lock; nothing was done
    Skipped { reason: String },
}

/// The main sync engine that orchestrates repository synchronization
#[derive(Clone)]
pub struct SyncEngine {
    options: SyncOptions,
    reconciler: MirrorReconciler,
}

impl SyncEngine {
    /// Create a new sync engine with a single-process reconciler
    pub fn new(options: SyncOptions) -> Self {
        Self::with_reconciler(options, MirrorReconciler::default())
    }

    pub fn with_reconciler(options: SyncOptions, reconciler: MirrorReconciler) -> Self {
        Self { options, reconciler }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Reconcile every repository sequentially, one result per repository
    pub async fn sync_all(&self, repositories: &[Repository]) -> Vec<SyncResult> {
        let total = repositories.len();
        let mut results = Vec::with_capacity(total);

        info!("Syncing {} repositories into {}", total, self.options.mirror_root.display());

        for (index, repo) in repositories.iter().enumerate() {
            let position = index + 1;
            info!(repository = %repo.full_name, "[{}/{}] syncing", position, total);
            if self.options.progress {
                println!("[{}/{}] {}", position, total, repo.full_name);
            }

            let result = self
                .reconciler
                .reconcile(repo, &self.options.mirror_root, &self.options.credential)
                .await;

            match result.action {
                SyncAction::Error => {
                    warn!(repository = %repo.full_name, "[{}/{}] error: {}", position, total, result.message)
                }
                action => info!(repository = %repo.full_name, "[{}/{}] {}", position, total, action),
            }
            if self.options.progress {
                println!("    {}: {}", result.action, result.message);
            }

            results.push(result);
        }

        results
    }

    /// Run a complete pass under the sync lock: list, reconcile, release.
    ///
    /// Lock contention is a normal outcome ([`RunOutcome::Skipped`]). The lock
    /// is released on every exit path, including provider failures and the
    /// future being dropped by a caller-level timeout.
    pub async fn run(
        &self,
        provider: &dyn RepositoryProvider,
        lock_dir: &Path,
        stale_timeout: Duration,
    ) -> Result<RunOutcome, SyncError> {
        let mut guard = match lock::acquire(lock_dir, stale_timeout).await? {
            LockAcquisition::Acquired(guard) => guard,
            LockAcquisition::Contended { message } => {
                info!("Skipping sync run: {}", message);
                return Ok(RunOutcome::Skipped { reason: message });
            }
        };

        let started_at = Utc::now();
        let start = Instant::now();
        info!("Starting repository synchronization via {}", provider.provider_name());

        let repositories = match provider.list_repositories().await {
            Ok(repositories) => repositories,
            Err(e) => {
                error!("Failed to list repositories: {}", e);
                guard.release();
                return Err(e.into());
            }
        };

        let results = self.sync_all(&repositories).await;
        guard.release();

        let summary = SyncSummary::from_results(results, started_at, start.elapsed());
        info!(
            "Sync completed in {:.2}s: {} cloned, {} updated, {} unchanged, {} failed",
            summary.duration.as_secs_f64(),
            summary.cloned,
            summary.updated,
            summary.unchanged,
            summary.failed
        );

        Ok(RunOutcome::Completed(summary))
    }
}
