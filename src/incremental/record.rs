//! Persisted state records
//!
//! One pretty-printed JSON file per cache key under the state root, named
//! `<sanitized key>-<hash>`. The hash covers the key and [`FORMAT_VERSION`],
//! so bumping the version orphans every old file instead of parsing it.
//!
//! Record files double as the cross-process lock target, so reads and writes
//! of a live record go through the handle held by [`KeyLock`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::context::ExecutionContext;
use super::dynamic_inputs::DynamicInputsState;
use super::fingerprint::PathStates;
use super::lock::{self, KeyLock};
use crate::error::{IncrementalError, Result};

/// Version of the on-disk record layout
pub const FORMAT_VERSION: u32 = 1;

const MAX_KEY_CHARS: usize = 50;
const HASH_CHARS: usize = 10;

/// Everything remembered about the last execution of one cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub code_version: String,
    pub input_values: BTreeMap<String, String>,
    pub input_files: BTreeSet<PathBuf>,
    pub input_files_state: PathStates,
    pub output_values: BTreeMap<String, String>,
    /// Kept in declaration order so a cache hit returns exactly what the block returned
    pub output_files: Vec<PathBuf>,
    pub output_files_state: PathStates,
    #[serde(default)]
    pub excluded_output_files: BTreeSet<PathBuf>,
    #[serde(default)]
    pub dynamic_inputs: DynamicInputsState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    pub format_version: u32,
}

impl StateRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|expires_at| expires_at <= now)
    }
}

/// File name for the record of `key`
pub fn state_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_CHARS)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(FORMAT_VERSION.to_string().as_bytes());
    let hash = hex::encode(hasher.finalize());

    format!("{}-{}", sanitized, &hash[..HASH_CHARS])
}

/// Directory of state records
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            IncrementalError::io(
                format!("Failed to create state directory: {}", root.display()),
                e,
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self, key: &str) -> PathBuf {
        self.root.join(state_file_name(key))
    }

    /// Read the record behind a held lock. Any failure is a cache miss.
    pub fn read(&self, lock: &mut KeyLock) -> Option<StateRecord> {
        let path = lock.path().to_path_buf();
        match read_from_start(lock.file()) {
            Ok(content) => parse_record(&content, &path),
            Err(e) => {
                debug!(state_file = %path.display(), error = %e, "state file is unreadable");
                None
            }
        }
    }

    /// Replace the record behind a held lock with a single truncate-then-write
    pub fn write(&self, lock: &mut KeyLock, record: &StateRecord) -> Result<()> {
        let path = lock.path().to_path_buf();
        let mut json = serde_json::to_string_pretty(record)?;
        json.push('\n');

        overwrite(lock.file(), json.as_bytes()).map_err(|e| {
            IncrementalError::io(format!("Failed to write state file: {}", path.display()), e)
        })
    }

    /// Delete the record behind a held lock
    pub fn discard(&self, lock: &KeyLock) -> Result<()> {
        remove_if_exists(lock.path())
    }

    /// Delete the record of `key`, waiting for any running execution of it
    pub async fn remove(&self, key: &str) -> Result<()> {
        let state_file = self.state_file(key);
        let held = lock::acquire(&ExecutionContext::new(), key, &state_file, None).await?;
        self.discard(&held)
    }

    /// Delete every record file, returning how many were removed.
    ///
    /// Each file is deleted under its lock, after any running execution of
    /// that key has written it.
    pub async fn clear(&self) -> Result<usize> {
        let files = self.list()?;
        for file in &files {
            let _held = lock::lock_file(file).await?;
            remove_if_exists(file)?;
        }
        Ok(files.len())
    }

    /// All record files under the state root, sorted by name
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => {
                return Err(IncrementalError::io(
                    format!("Failed to read state directory: {}", self.root.display()),
                    e,
                ))
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| {
                IncrementalError::io(
                    format!("Failed to read state directory: {}", self.root.display()),
                    e,
                )
            })?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if is_file && !hidden {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Parse a record file without locking it; `None` when it is not a valid record
    pub fn read_record_file(path: &Path) -> Result<Option<StateRecord>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(parse_record(&content, path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IncrementalError::io(
                format!("Failed to read state file: {}", path.display()),
                e,
            )),
        }
    }
}

fn read_from_start(file: &mut File) -> io::Result<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(content)
}

fn overwrite(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(bytes)?;
    file.flush()
}

fn parse_record(content: &str, path: &Path) -> Option<StateRecord> {
    if content.trim().is_empty() {
        debug!(state_file = %path.display(), "state file is empty");
        return None;
    }

    let record: StateRecord = match serde_json::from_str(content) {
        Ok(record) => record,
        Err(e) => {
            debug!(state_file = %path.display(), error = %e, "state file is not a valid record");
            return None;
        }
    };

    if record.format_version != FORMAT_VERSION {
        debug!(
            state_file = %path.display(),
            found = record.format_version,
            expected = FORMAT_VERSION,
            "state file has a different format version"
        );
        return None;
    }

    Some(record)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IncrementalError::io(
            format!("Failed to delete state file: {}", path.display()),
            e,
        )),
    }
}
