// Common test utilities shared across acceptance tests
//
// Every test works inside its own temporary project directory holding both
// the files a computation reads and writes and the state directory, so tests
// can run in parallel. Tests that touch process environment variables are
// marked #[serial].

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use incstate::{CacheOptions, IncrementalCache};

/// Isolated project directory with its own state root
pub struct TestProject {
    temp_dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp_dir.path().join(rel)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path(".incstate/state")
    }

    /// Cache over this project's state directory, with the write self-check on
    pub fn cache(&self) -> IncrementalCache {
        IncrementalCache::new(
            self.state_dir(),
            CacheOptions {
                self_check: true,
                ..Default::default()
            },
        )
        .unwrap()
    }

    pub fn create_file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn read_file(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    /// Move the modification time of a file without touching its content
    pub fn touch(&self, rel: &str, offset: Duration) {
        let file = fs::File::options().write(true).open(self.path(rel)).unwrap();
        file.set_modified(SystemTime::now() + offset).unwrap();
    }
}
