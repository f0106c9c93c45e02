//! Execution context threaded through cached computations
//!
//! The context is the only way a computation reads environment-sensitive
//! facts. Inside a cached block it carries the block's recorder, so every read
//! becomes a dynamic input of that cache entry. It also remembers which cache
//! keys are locked by enclosing calls, which makes `execute` reentrant for the
//! same key.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

use super::dynamic_inputs::{env_var, system_property, DynamicInputsRecorder, DynamicInputsState};

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    recorder: Option<Arc<DynamicInputsRecorder>>,
    held_keys: Arc<BTreeSet<String>>,
}

impl ExecutionContext {
    /// A root context: no active recorder, no held locks
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a system property, recording it when a computation is active
    pub fn read_system_property(&self, name: &str) -> Option<String> {
        let value = system_property(name);
        match &self.recorder {
            Some(recorder) => recorder.record_system_property(name, value.clone()),
            None => trace!(property = name, "unrecorded system property read"),
        }
        value
    }

    /// Read an environment variable, recording it when a computation is active
    pub fn read_env(&self, name: &str) -> Option<String> {
        let value = env_var(name);
        match &self.recorder {
            Some(recorder) => recorder.record_env(name, value.clone()),
            None => trace!(variable = name, "unrecorded environment variable read"),
        }
        value
    }

    /// Check whether a path exists, recording the answer when a computation is active
    pub fn check_path_existence(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let exists = path.exists();
        match &self.recorder {
            Some(recorder) => recorder.record_path_existence(path, exists),
            None => trace!(path = %path.display(), "unrecorded path existence check"),
        }
        exists
    }

    pub(crate) fn holds_lock(&self, key: &str) -> bool {
        self.held_keys.contains(key)
    }

    /// Context for the block of `key`: a fresh recorder and `key` marked as held
    pub(crate) fn nested(&self, key: &str, recorder: Arc<DynamicInputsRecorder>) -> Self {
        let mut held_keys = (*self.held_keys).clone();
        held_keys.insert(key.to_string());
        Self {
            recorder: Some(recorder),
            held_keys: Arc::new(held_keys),
        }
    }

    /// Make the enclosing computation (if any) depend on `state` as well
    pub(crate) fn propagate(&self, state: &DynamicInputsState) {
        if let Some(recorder) = &self.recorder {
            if !state.is_empty() {
                recorder.merge(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_reads_without_recorder_are_plain_reads() {
        std::env::set_var("INCSTATE_CTX_PLAIN", "value");
        let ctx = ExecutionContext::new();
        assert!(ctx.recorder.is_none());
        assert_eq!(ctx.read_env("INCSTATE_CTX_PLAIN").as_deref(), Some("value"));
        assert_eq!(ctx.read_env("INCSTATE_CTX_UNSET_VARIABLE"), None);
        assert!(ctx.read_system_property("os.arch").is_some());
        std::env::remove_var("INCSTATE_CTX_PLAIN");
    }

    #[test]
    #[serial]
    fn test_reads_with_recorder_are_recorded() {
        std::env::set_var("INCSTATE_CTX_RECORDED", "1");
        let recorder = Arc::new(DynamicInputsRecorder::new());
        let ctx = ExecutionContext::new().nested("k", recorder.clone());

        ctx.read_env("INCSTATE_CTX_RECORDED");
        ctx.read_system_property("os.name");
        ctx.check_path_existence("/definitely/not/here");

        let state = recorder.snapshot();
        assert_eq!(
            state.environment_variables["INCSTATE_CTX_RECORDED"].as_deref(),
            Some("1")
        );
        assert!(state.system_properties.contains_key("os.name"));
        assert!(!state.paths_existence[Path::new("/definitely/not/here")]);
        std::env::remove_var("INCSTATE_CTX_RECORDED");
    }

    #[test]
    fn test_nested_tracks_held_keys() {
        let root = ExecutionContext::new();
        let outer = root.nested("outer", Arc::new(DynamicInputsRecorder::new()));
        let inner = outer.nested("inner", Arc::new(DynamicInputsRecorder::new()));

        assert!(!root.holds_lock("outer"));
        assert!(outer.holds_lock("outer"));
        assert!(!outer.holds_lock("inner"));
        assert!(inner.holds_lock("outer"));
        assert!(inner.holds_lock("inner"));
    }

    #[test]
    fn test_propagate_merges_into_active_recorder() {
        let recorder = Arc::new(DynamicInputsRecorder::new());
        let ctx = ExecutionContext::new().nested("outer", recorder.clone());

        let mut nested = DynamicInputsState::default();
        nested
            .environment_variables
            .insert("BAR".to_string(), Some("x".to_string()));
        ctx.propagate(&nested);

        assert_eq!(
            recorder.snapshot().environment_variables["BAR"].as_deref(),
            Some("x")
        );

        // No recorder: nothing to propagate into, and nothing fails
        ExecutionContext::new().propagate(&nested);
    }
}
