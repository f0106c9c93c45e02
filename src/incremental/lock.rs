//! Per-key exclusion for `execute`
//!
//! Two layers, always acquired in this order and held for a whole
//! read-check-build-write cycle:
//!
//! 1. an in-process async mutex per cache key, from a registry that only grows
//!    (key cardinality is bounded by the distinct cached operations of one run);
//! 2. an exclusive OS lock on the state file itself, shared with other processes
//!    using the same state directory.
//!
//! A call whose [`ExecutionContext`] already holds the key (a block calling
//! `execute` on its own key) skips both layers. Both layers are released on
//! drop, including when the owning future is cancelled.
//!
//! There is no acquisition timeout unless one is configured: a stuck
//! computation or a lock left behind by a crashed process blocks forever.

use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::context::ExecutionContext;
use crate::error::{IncrementalError, Result};

type KeyMutex = Arc<tokio::sync::Mutex<()>>;

fn key_mutex(key: &str) -> KeyMutex {
    static REGISTRY: OnceLock<Mutex<HashMap<String, KeyMutex>>> = OnceLock::new();
    let mut registry = REGISTRY
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    registry.entry(key.to_string()).or_default().clone()
}

/// Exclusive access to one cache key and its state file
#[derive(Debug)]
pub struct KeyLock {
    _in_process: Option<OwnedMutexGuard<()>>,
    file: File,
    path: PathBuf,
}

impl KeyLock {
    /// Handle to the state file; reads and writes must go through it
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquire both lock layers for `key`, creating `state_file` if absent
pub async fn acquire(
    ctx: &ExecutionContext,
    key: &str,
    state_file: &Path,
    timeout: Option<Duration>,
) -> Result<KeyLock> {
    if ctx.holds_lock(key) {
        debug!(key, "lock already held by an enclosing computation");
        return Ok(KeyLock {
            _in_process: None,
            file: open_state_file(state_file)?,
            path: state_file.to_path_buf(),
        });
    }

    let wait = async {
        let guard = key_mutex(key).lock_owned().await;
        let file = lock_file(state_file).await?;
        Ok::<_, IncrementalError>(KeyLock {
            _in_process: Some(guard),
            file,
            path: state_file.to_path_buf(),
        })
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            IncrementalError::LockTimeout {
                key: key.to_string(),
                state_file: state_file.to_path_buf(),
                waited: limit,
            }
        })?,
        None => wait.await,
    }
}

fn open_state_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            IncrementalError::io(
                format!("Failed to create state directory: {}", parent.display()),
                e,
            )
        })?;
    }

    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| IncrementalError::io(format!("Failed to open state file: {}", path.display()), e))
}

/// Exclusively lock the file at `path`, creating it if absent.
///
/// Only the OS layer is taken, so this also excludes `execute` calls of the
/// same key in this process.
pub(crate) async fn lock_file(path: &Path) -> Result<File> {
    let owned = path.to_path_buf();
    // The blocking lock runs off the async workers. If the waiting future is
    // dropped, the handle is closed as soon as the lock is granted.
    tokio::task::spawn_blocking(move || lock_current_file(&owned))
        .await
        .map_err(|e| {
            IncrementalError::io(
                format!("Lock task failed for state file: {}", path.display()),
                io::Error::other(e),
            )
        })?
}

/// Lock whatever file is at `path` once the lock is granted; a file deleted
/// while waiting is let go and the new one is locked instead.
fn lock_current_file(path: &Path) -> Result<File> {
    loop {
        let file = open_state_file(path)?;
        file.lock_exclusive().map_err(|e| {
            IncrementalError::io(format!("Failed to lock state file: {}", path.display()), e)
        })?;
        if is_current(&file, path) {
            return Ok(file);
        }
        debug!(state_file = %path.display(), "state file replaced while waiting for its lock");
    }
}

#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> bool {
    path.exists()
}
