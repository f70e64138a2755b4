//! Cross-process sync lock
//!
//! Serializes synchronization runs on a host. The placeholder file
//! `<lock_dir>/.syncreeper.lock` always exists once the guard has been used;
//! ownership is an owner marker next to it, created with an atomic
//! exclusive-create so two acquirers can never both succeed. The marker's
//! mtime is the lock age: a holder refreshes it while alive, and a marker
//! older than the staleness timeout is presumed abandoned and reclaimed.
//!
//! Acquisition never waits or retries. A missed periodic run is preferable to
//! a queue of stacked runs.

use chrono::Utc;
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LockError;

/// Placeholder file name inside the lock directory
pub const LOCK_FILE_NAME: &str = ".syncreeper.lock";

/// Owner marker created while the lock is held
pub const OWNER_FILE_NAME: &str = ".syncreeper.lock.owner";

/// Message reported when another run holds the lock
pub const CONTENTION_MESSAGE: &str = "Another sync operation is in progress";

/// Age after which a held lock is presumed abandoned
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Outcome of a single acquisition attempt
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(SyncLock),
    /// Another live run holds the lock. Expected, not an error.
    Contended { message: String },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }

    /// Contention message, if the lock was not acquired
    pub fn error(&self) -> Option<&str> {
        match self {
            LockAcquisition::Acquired(_) => None,
            LockAcquisition::Contended { message } => Some(message),
        }
    }

    pub fn into_lock(self) -> Option<SyncLock> {
        match self {
            LockAcquisition::Acquired(lock) => Some(lock),
            LockAcquisition::Contended { .. } => None,
        }
    }
}

/// Lock state as seen by a non-mutating observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Held { pid: Option<u32>, age: Duration },
    /// Held past the staleness timeout; the next acquirer reclaims it
    Stale { pid: Option<u32>, age: Duration },
}

/// A held sync lock. Released on [`SyncLock::release`] or drop.
#[derive(Debug)]
pub struct SyncLock {
    owner_path: PathBuf,
    token: String,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl SyncLock {
    pub fn owner_path(&self) -> &Path {
        &self.owner_path
    }

    /// Release the lock. Idempotent; failures are logged and swallowed.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }

        match fs::read_to_string(&self.owner_path) {
            Ok(contents) if contents == self.token => {
                if let Err(e) = fs::remove_file(&self.owner_path) {
                    warn!("Failed to release sync lock {}: {}", self.owner_path.display(), e);
                } else {
                    debug!("Released sync lock {}", self.owner_path.display());
                }
            }
            Ok(_) => warn!(
                "Sync lock {} was reclaimed by another run; leaving it in place",
                self.owner_path.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Sync lock {} already removed", self.owner_path.display());
            }
            Err(e) => warn!("Failed to read sync lock {}: {}", self.owner_path.display(), e),
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Try once to take the sync lock in `lock_dir`.
///
/// Must be called from within a tokio runtime: the held lock keeps its
/// marker fresh from a background task.
pub async fn acquire(lock_dir: &Path, stale_timeout: Duration) -> Result<LockAcquisition, LockError> {
    ensure_lock_file(lock_dir)?;

    let owner_path = lock_dir.join(OWNER_FILE_NAME);
    let token = format!(
        "{}\n{}\n",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );

    if try_create_owner(&owner_path, &token)? {
        return Ok(acquired(owner_path, token, stale_timeout));
    }

    match owner_age(&owner_path)? {
        Some(age) if age > stale_timeout => {
            info!(
                "Reclaiming stale sync lock {} (age {}s)",
                owner_path.display(),
                age.as_secs()
            );
            if take_if_stale(&owner_path, &token, stale_timeout)?
                && try_create_owner(&owner_path, &token)?
            {
                return Ok(acquired(owner_path, token, stale_timeout));
            }
        }
        // Released between our create attempt and the age check
        None => {
            if try_create_owner(&owner_path, &token)? {
                return Ok(acquired(owner_path, token, stale_timeout));
            }
        }
        Some(_) => {}
    }

    debug!("Sync lock {} is held by another run", owner_path.display());
    Ok(LockAcquisition::Contended {
        message: CONTENTION_MESSAGE.to_string(),
    })
}

/// Whether a live (non-stale) lock is currently held. Never mutates.
pub fn is_locked(lock_dir: &Path) -> bool {
    matches!(
        lock_status(lock_dir, DEFAULT_STALE_TIMEOUT),
        Ok(LockStatus::Held { .. })
    )
}

/// Current lock state for status reporting. Never mutates.
pub fn lock_status(lock_dir: &Path, stale_timeout: Duration) -> Result<LockStatus, LockError> {
    let owner_path = lock_dir.join(OWNER_FILE_NAME);
    let Some(age) = owner_age(&owner_path)? else {
        return Ok(LockStatus::Unlocked);
    };

    let pid = fs::read_to_string(&owner_path)
        .ok()
        .and_then(|contents| contents.lines().next().and_then(|line| line.trim().parse().ok()));

    if age > stale_timeout {
        Ok(LockStatus::Stale { pid, age })
    } else {
        Ok(LockStatus::Held { pid, age })
    }
}

/// Check whether the recorded lock owner process still exists
#[cfg(unix)]
pub fn owner_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn owner_alive(_pid: u32) -> bool {
    true
}

fn ensure_lock_file(lock_dir: &Path) -> Result<(), LockError> {
    fs::create_dir_all(lock_dir).map_err(|source| LockError::CreateDir {
        path: lock_dir.to_path_buf(),
        source,
    })?;

    let lock_file = lock_dir.join(LOCK_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_file)
        .map_err(|source| LockError::Io {
            path: lock_file,
            source,
        })?;
    Ok(())
}

/// Atomically create the owner marker; false if it already exists
fn try_create_owner(owner_path: &Path, token: &str) -> Result<bool, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(owner_path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(source) => {
            return Err(LockError::Io {
                path: owner_path.to_path_buf(),
                source,
            })
        }
    };

    file.write_all(token.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|source| LockError::Io {
            path: owner_path.to_path_buf(),
            source,
        })?;
    Ok(true)
}

/// Move a stale marker out of the way, leaving a fresh one in place.
///
/// The marker is renamed to a tombstone unique to this acquirer before its age
/// is checked again, so a marker another run created after our first age check
/// is never deleted. Returns true when the owner path is free.
fn take_if_stale(owner_path: &Path, token: &str, stale_timeout: Duration) -> Result<bool, LockError> {
    let nonce = token.trim().replace('\n', "-");
    let tombstone = owner_path.with_file_name(format!("{}.reclaim-{}", OWNER_FILE_NAME, nonce));

    match fs::rename(owner_path, &tombstone) {
        Ok(()) => {}
        // Another acquirer reclaimed it first
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(source) => {
            return Err(LockError::Io {
                path: owner_path.to_path_buf(),
                source,
            })
        }
    }

    let still_stale = matches!(owner_age(&tombstone)?, Some(age) if age > stale_timeout);
    if !still_stale {
        // Put the live marker back unless yet another owner has appeared
        match fs::hard_link(&tombstone, owner_path) {
            Ok(()) => debug!("Sync lock {} was refreshed during reclaim", owner_path.display()),
            Err(e) => warn!(
                "Could not restore sync lock {} after an aborted reclaim: {}",
                owner_path.display(),
                e
            ),
        }
    }

    if let Err(e) = fs::remove_file(&tombstone) {
        warn!("Failed to remove lock tombstone {}: {}", tombstone.display(), e);
    }
    Ok(still_stale)
}

/// Age of the owner marker, or None if no marker exists
fn owner_age(owner_path: &Path) -> Result<Option<Duration>, LockError> {
    let metadata = match fs::metadata(owner_path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: owner_path.to_path_buf(),
                source,
            })
        }
    };

    let modified = metadata.modified().map_err(|source| LockError::Io {
        path: owner_path.to_path_buf(),
        source,
    })?;
    // An mtime in the future counts as fresh
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

fn acquired(owner_path: PathBuf, token: String, stale_timeout: Duration) -> LockAcquisition {
    info!("Acquired sync lock {}", owner_path.display());
    let refresher = spawn_refresher(owner_path.clone(), stale_timeout);
    LockAcquisition::Acquired(SyncLock {
        owner_path,
        token,
        refresher: Some(refresher),
        released: false,
    })
}

/// Keep the marker's mtime fresh so a long run is never mistaken for a crash
fn spawn_refresher(owner_path: PathBuf, stale_timeout: Duration) -> JoinHandle<()> {
    let period = (stale_timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = filetime::set_file_mtime(&owner_path, FileTime::now()) {
                warn!("Failed to refresh sync lock {}: {}", owner_path.display(), e);
            }
        }
    })
}
