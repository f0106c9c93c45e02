//! File state tracking
//!
//! Turns a list of paths into a map of `path -> fingerprint` built from file
//! metadata (size, modification time and, on Unix, permission bits, owner and
//! group). File contents are never read: metadata is a fast proxy for identity.
//!
//! The output is a `BTreeMap`, so equal inputs on an unchanged filesystem
//! always produce byte-identical maps.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{IncrementalError, Result};

/// Sentinel recorded for a path that does not exist
pub const MISSING: &str = "MISSING";

/// Sentinel recorded for a directory without any counted children
pub const EMPTY_DIR: &str = "EMPTY DIR";

/// Fingerprints keyed by path string
pub type PathStates = BTreeMap<String, String>;

/// Compute the state of every path in `paths`, skipping anything under `excluded`.
///
/// Directories are walked recursively and contribute entries only for their
/// descendants; a directory that ends up with no counted children is recorded
/// as [`EMPTY_DIR`]. A missing top-level path is recorded as [`MISSING`],
/// or fails with [`IncrementalError::MissingPath`] when `fail_on_missing` is set.
pub fn path_list_state<'a, I>(
    paths: I,
    excluded: &BTreeSet<PathBuf>,
    fail_on_missing: bool,
) -> Result<PathStates>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut states = PathStates::new();

    for path in paths {
        if is_excluded(path, excluded) {
            continue;
        }

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fail_on_missing {
                    return Err(IncrementalError::MissingPath { path: path.clone() });
                }
                states.insert(path_key(path), MISSING.to_string());
                continue;
            }
            Err(e) => {
                return Err(IncrementalError::io(
                    format!("Failed to read metadata: {}", path.display()),
                    e,
                ))
            }
        };

        if metadata.is_dir() {
            add_directory(path, excluded, &mut states)?;
        } else {
            states.insert(path_key(path), file_fingerprint(&metadata));
        }
    }

    Ok(states)
}

fn add_directory(root: &Path, excluded: &BTreeSet<PathBuf>, states: &mut PathStates) -> Result<()> {
    let mut non_empty: HashSet<PathBuf> = HashSet::new();
    let mut directories = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.path(), excluded));

    for entry in walker {
        let entry = entry.map_err(|e| {
            IncrementalError::io(
                format!("Failed to walk directory: {}", root.display()),
                io::Error::from(e),
            )
        })?;

        if entry.depth() > 0 {
            if let Some(parent) = entry.path().parent() {
                non_empty.insert(parent.to_path_buf());
            }
        }

        if entry.file_type().is_dir() {
            directories.push(entry.into_path());
            continue;
        }

        // Nested symlinks are not followed: the link itself is fingerprinted
        let metadata = entry.metadata().map_err(|e| {
            IncrementalError::io(
                format!("Failed to read metadata: {}", entry.path().display()),
                io::Error::from(e),
            )
        })?;
        let fingerprint = file_fingerprint(&metadata);
        states.insert(path_key(entry.path()), fingerprint);
    }

    for directory in directories {
        if !non_empty.contains(&directory) {
            states.insert(path_key(&directory), EMPTY_DIR.to_string());
        }
    }

    Ok(())
}

fn is_excluded(path: &Path, excluded: &BTreeSet<PathBuf>) -> bool {
    excluded.iter().any(|ex| path.starts_with(ex))
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn file_fingerprint(metadata: &fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_else(|_| "unknown".to_string());

    let mut fingerprint = format!("size={} mtime={}", metadata.len(), mtime);

    #[cfg(unix)]
    {
        use std::fmt::Write as _;
        use std::os::unix::fs::MetadataExt;
        let _ = write!(
            fingerprint,
            " mode={:o} uid={} gid={}",
            metadata.mode() & 0o7777,
            metadata.uid(),
            metadata.gid()
        );
    }

    fingerprint
}
