//! Dynamic input tracking
//!
//! Some computations depend on ambient facts that cannot be declared up
//! front: environment variables, system properties, whether some path
//! exists. Reads made through [`ExecutionContext`](super::ExecutionContext)
//! are appended to the active [`DynamicInputsRecorder`], and the recorded
//! values are re-queried live when the cache entry is validated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError, RwLock};

use super::changes::{value_change, Change, ChangeType};

/// Ambient facts observed by one computation, with their values at observation time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicInputsState {
    #[serde(default)]
    pub system_properties: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub paths_existence: BTreeMap<PathBuf, bool>,
}

impl DynamicInputsState {
    pub fn is_empty(&self) -> bool {
        self.system_properties.is_empty()
            && self.environment_variables.is_empty()
            && self.paths_existence.is_empty()
    }

    /// Merge another state into this one; later observations win
    pub fn merge(&mut self, other: &DynamicInputsState) {
        self.system_properties.extend(
            other
                .system_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.environment_variables.extend(
            other
                .environment_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.paths_existence
            .extend(other.paths_existence.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// Re-query every recorded fact live (without recording) and report differences
    pub fn changes(&self) -> Vec<Change> {
        let mut changes = Vec::new();

        for (name, recorded) in &self.system_properties {
            if let Some(kind) = value_change(recorded, &system_property(name)) {
                changes.push(Change::new(format!("property:{name}"), kind));
            }
        }

        for (name, recorded) in &self.environment_variables {
            if let Some(kind) = value_change(recorded, &env_var(name)) {
                changes.push(Change::new(format!("env:{name}"), kind));
            }
        }

        for (path, existed) in &self.paths_existence {
            let exists = path.exists();
            if *existed != exists {
                let kind = if exists {
                    ChangeType::Created
                } else {
                    ChangeType::Deleted
                };
                changes.push(Change::new(path.to_string_lossy(), kind));
            }
        }

        changes.sort();
        changes
    }
}

/// Collects the dynamic inputs read while one cached computation runs
#[derive(Debug, Default)]
pub struct DynamicInputsRecorder {
    state: Mutex<DynamicInputsState>,
}

impl DynamicInputsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_system_property(&self, name: &str, value: Option<String>) {
        self.with_state(|state| {
            state.system_properties.insert(name.to_string(), value);
        });
    }

    pub fn record_env(&self, name: &str, value: Option<String>) {
        self.with_state(|state| {
            state.environment_variables.insert(name.to_string(), value);
        });
    }

    pub fn record_path_existence(&self, path: &Path, exists: bool) {
        self.with_state(|state| {
            state.paths_existence.insert(path.to_path_buf(), exists);
        });
    }

    /// Fold the final dynamic inputs of a nested computation into this recorder
    pub fn merge(&self, other: &DynamicInputsState) {
        self.with_state(|state| state.merge(other));
    }

    pub fn snapshot(&self) -> DynamicInputsState {
        self.with_state(|state| state.clone())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DynamicInputsState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

/// Read an environment variable without recording it
pub fn env_var(name: &str) -> Option<String> {
    std::env::var_os(name).map(|value| value.to_string_lossy().into_owned())
}

fn system_properties() -> &'static RwLock<BTreeMap<String, String>> {
    static PROPERTIES: OnceLock<RwLock<BTreeMap<String, String>>> = OnceLock::new();
    PROPERTIES.get_or_init(|| RwLock::new(host_properties()))
}

fn host_properties() -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("os.name".to_string(), std::env::consts::OS.to_string());
    properties.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
    properties.insert("os.family".to_string(), std::env::consts::FAMILY.to_string());
    properties.insert(
        "file.separator".to_string(),
        std::path::MAIN_SEPARATOR.to_string(),
    );
    properties.insert(
        "path.separator".to_string(),
        if cfg!(windows) { ";" } else { ":" }.to_string(),
    );
    properties.insert(
        "line.separator".to_string(),
        if cfg!(windows) { "\r\n" } else { "\n" }.to_string(),
    );
    if let Some(home) = dirs::home_dir() {
        properties.insert("user.home".to_string(), home.to_string_lossy().into_owned());
    }
    if let Ok(cwd) = std::env::current_dir() {
        properties.insert("user.dir".to_string(), cwd.to_string_lossy().into_owned());
    }
    properties
}

/// Read a system property without recording it
pub fn system_property(name: &str) -> Option<String> {
    system_properties()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

/// Set a process-wide system property
pub fn set_system_property(name: impl Into<String>, value: impl Into<String>) {
    system_properties()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.into(), value.into());
}

/// Remove a process-wide system property
pub fn clear_system_property(name: &str) {
    system_properties()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
}
