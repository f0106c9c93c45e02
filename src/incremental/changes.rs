//! Change computation between two states of the same cached computation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::fingerprint::MISSING;

/// Kind of difference between an old and a new state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Created => "CREATED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// One output-level difference.
///
/// For file outputs `path` is the file path. Dynamic inputs use
/// `env:NAME` and `property:NAME` for variables and system properties, and
/// the plain path for path-existence checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
}

impl Change {
    pub fn new(path: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.change_type, self.path)
    }
}

/// Diff two fingerprint maps. A [`MISSING`] sentinel counts as absent.
pub fn compute_changes(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<Change> {
    let present = |map: &BTreeMap<String, String>, path: &str| -> Option<String> {
        map.get(path).filter(|state| state.as_str() != MISSING).cloned()
    };

    let mut changes = Vec::new();
    for path in old.keys().chain(new.keys().filter(|k| !old.contains_key(*k))) {
        match (present(old, path), present(new, path)) {
            (None, Some(_)) => changes.push(Change::new(path.clone(), ChangeType::Created)),
            (Some(_), None) => changes.push(Change::new(path.clone(), ChangeType::Deleted)),
            (Some(before), Some(after)) if before != after => {
                changes.push(Change::new(path.clone(), ChangeType::Modified))
            }
            _ => {}
        }
    }

    changes.sort();
    changes
}

/// Classify a change between two optional values of one ambient fact
pub fn value_change<T: PartialEq>(before: &Option<T>, after: &Option<T>) -> Option<ChangeType> {
    match (before, after) {
        (None, Some(_)) => Some(ChangeType::Created),
        (Some(_), None) => Some(ChangeType::Deleted),
        (Some(a), Some(b)) if a != b => Some(ChangeType::Modified),
        _ => None,
    }
}
