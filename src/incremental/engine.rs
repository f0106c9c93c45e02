//! Incremental execution engine
//!
//! `execute` runs a computation only when its previous results can no longer
//! be trusted. For one cache key the flow is:
//!
//! ```text
//! CHECKING -> UP_TO_DATE
//!          -> BUILDING -> WRITING -> DONE
//! ```
//!
//! A previous record is reused when the code version, the input values, the
//! input path set, the input and output fingerprints and every recorded
//! dynamic input still match, and the record has not expired.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use super::changes::{compute_changes, Change};
use super::context::ExecutionContext;
use super::dynamic_inputs::DynamicInputsRecorder;
use super::fingerprint::{path_list_state, PathStates};
use super::lock::{self, KeyLock};
use super::record::{StateRecord, StateStore, FORMAT_VERSION};
use crate::error::{IncrementalError, Result};
use crate::logging::{operations, status};

/// What a cached computation produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Declared outputs; each must exist once the computation returns
    pub output_files: Vec<PathBuf>,
    pub output_values: BTreeMap<String, String>,
    /// Paths under the outputs that are not fingerprinted
    pub excluded_output_files: BTreeSet<PathBuf>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn new(output_files: Vec<PathBuf>) -> Self {
        Self {
            output_files,
            ..Default::default()
        }
    }

    pub fn with_output_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.output_values.insert(name.into(), value.into());
        self
    }

    pub fn with_excluded_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded_output_files.insert(path.into());
        self
    }

    pub fn with_expiration_time(mut self, expiration_time: DateTime<Utc>) -> Self {
        self.expiration_time = Some(expiration_time);
        self
    }
}

/// What `execute` returns, whether or not the computation ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    pub output_files: Vec<PathBuf>,
    pub output_values: BTreeMap<String, String>,
    /// Differences against the previous execution; empty on a cache hit
    pub changes: Vec<Change>,
    pub expiration_time: Option<DateTime<Utc>>,
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Identifies the code that produced a record; a different value invalidates it
    pub code_version: String,
    /// Re-read every record right after writing it and fail loudly on any mismatch
    pub self_check: bool,
    /// Upper bound on waiting for a key's locks; `None` waits forever
    pub lock_timeout: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            code_version: env!("CARGO_PKG_VERSION").to_string(),
            self_check: cfg!(debug_assertions),
            lock_timeout: None,
        }
    }
}

/// Incremental cache over one state directory
#[derive(Debug, Clone)]
pub struct IncrementalCache {
    store: StateStore,
    options: CacheOptions,
}

impl IncrementalCache {
    pub fn new(state_root: impl Into<PathBuf>, options: CacheOptions) -> Result<Self> {
        if options.code_version.is_empty() {
            return Err(IncrementalError::Config(
                "code version must not be empty".to_string(),
            ));
        }
        Ok(Self {
            store: StateStore::new(state_root)?,
            options,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Run `block` unless the record of `key` proves its previous outputs are still valid.
    ///
    /// `block` receives the context it must use for environment reads and for
    /// nested `execute` calls. Calls for the same key are serialized, within
    /// this process and across processes sharing the state directory.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        key: &str,
        input_values: BTreeMap<String, String>,
        input_files: &[PathBuf],
        force_recalculation: bool,
        block: F,
    ) -> Result<ExecuteResult>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<ExecutionResult>>,
    {
        let span = info_span!(
            "run",
            key,
            configuration = ?input_values,
            inputs = ?input_files,
            outputs = field::Empty,
            status = field::Empty,
        );

        self.run(ctx, key, input_values, input_files, force_recalculation, block)
            .instrument(span)
            .await
    }

    /// Like [`execute`](Self::execute), returning only the output paths
    pub async fn execute_for_files<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        key: &str,
        input_values: BTreeMap<String, String>,
        input_files: &[PathBuf],
        force_recalculation: bool,
        block: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<ExecutionResult>>,
    {
        let result = self
            .execute(ctx, key, input_values, input_files, force_recalculation, block)
            .await?;
        Ok(result.output_files)
    }

    async fn run<F, Fut>(
        &self,
        ctx: &ExecutionContext,
        key: &str,
        input_values: BTreeMap<String, String>,
        input_files: &[PathBuf],
        force_recalculation: bool,
        block: F,
    ) -> Result<ExecuteResult>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<ExecutionResult>>,
    {
        ensure_absolute(input_files)?;
        let input_files: BTreeSet<PathBuf> = input_files.iter().cloned().collect();
        let state_file = self.store.state_file(key);

        let mut held = lock::acquire(ctx, key, &state_file, self.options.lock_timeout).await?;

        // CHECKING
        let (cached, input_state, outdated) =
            info_span!("get-cached-state").in_scope(|| -> Result<_> {
                let input_state = path_list_state(&input_files, &BTreeSet::new(), false)?;
                let cached = self.store.read(&mut held);
                let outdated = cached.as_ref().map_or(true, |record| {
                    self.is_outdated(key, &state_file, record, &input_values, &input_files, &input_state)
                });
                Ok((cached, input_state, outdated))
            })?;

        if let Some(record) = &cached {
            if !outdated && !force_recalculation {
                ctx.propagate(&record.dynamic_inputs);
                Span::current().record("status", status::UP_TO_DATE);
                info!(
                    operation = operations::EXECUTE,
                    status = status::UP_TO_DATE,
                    key,
                    state_file = %state_file.display(),
                    "up-to-date"
                );
                return Ok(ExecuteResult {
                    output_files: record.output_files.clone(),
                    output_values: record.output_values.clone(),
                    changes: Vec::new(),
                    expiration_time: record.expiration_time,
                });
            }
        } else {
            debug!(key, state_file = %state_file.display(), "no usable state -> rebuilding");
        }

        if force_recalculation {
            debug!(key, "recalculation forced by caller");
        }

        // BUILDING
        let recorder = Arc::new(DynamicInputsRecorder::new());
        let result = block(ctx.nested(key, recorder.clone()))
            .instrument(info_span!("execute"))
            .await
            .map_err(|source| {
                Span::current().record("status", status::ERROR);
                IncrementalError::Computation {
                    key: key.to_string(),
                    source,
                }
            })?;

        ensure_absolute(&result.output_files)?;
        let output_state = info_span!("read-new-file-states", outputs = ?result.output_files)
            .in_scope(|| path_list_state(&result.output_files, &result.excluded_output_files, true))
            .map_err(|e| match e {
                IncrementalError::MissingPath { path } => IncrementalError::MissingOutput {
                    key: key.to_string(),
                    path,
                    state_file: state_file.clone(),
                },
                other => other,
            })?;

        // WRITING
        let record = StateRecord {
            code_version: self.options.code_version.clone(),
            input_values,
            input_files,
            input_files_state: input_state,
            output_values: result.output_values,
            output_files: result.output_files,
            output_files_state: output_state,
            excluded_output_files: result.excluded_output_files,
            dynamic_inputs: recorder.snapshot(),
            expiration_time: result.expiration_time,
            format_version: FORMAT_VERSION,
        };

        info_span!("write-state", state_file = %state_file.display())
            .in_scope(|| self.store.write(&mut held, &record))?;

        if self.options.self_check {
            self.verify_written(key, &mut held, &record)?;
        }

        // DONE
        let no_outputs = PathStates::new();
        let old_outputs = cached
            .as_ref()
            .map(|old| &old.output_files_state)
            .unwrap_or(&no_outputs);
        let mut changes = compute_changes(old_outputs, &record.output_files_state);
        if let Some(old) = &cached {
            changes.extend(old.dynamic_inputs.changes());
        }
        changes.sort();
        changes.dedup();

        ctx.propagate(&record.dynamic_inputs);

        let span = Span::current();
        span.record("status", status::EXECUTED);
        span.record("outputs", field::debug(&record.output_files));
        info!(
            operation = operations::EXECUTE,
            status = status::EXECUTED,
            key,
            changes = changes.len(),
            state_file = %state_file.display(),
            "executed"
        );

        Ok(ExecuteResult {
            output_files: record.output_files,
            output_values: record.output_values,
            changes,
            expiration_time: record.expiration_time,
        })
    }

    /// Check every field of `record` against the current inputs, logging each mismatch
    fn is_outdated(
        &self,
        key: &str,
        state_file: &Path,
        record: &StateRecord,
        input_values: &BTreeMap<String, String>,
        input_files: &BTreeSet<PathBuf>,
        input_state: &PathStates,
    ) -> bool {
        let mut mismatches: Vec<&str> = Vec::new();

        if record.code_version != self.options.code_version {
            debug!(
                key,
                old = %record.code_version,
                new = %self.options.code_version,
                "code version changed"
            );
            mismatches.push("codeVersion");
        }

        if let Some(expires_at) = record.expiration_time {
            if record.is_expired(Utc::now()) {
                debug!(key, expired_at = %expires_at, "state expired");
                mismatches.push("expirationTime");
            }
        }

        if record.input_values != *input_values {
            debug!(
                key,
                old = ?record.input_values,
                new = ?input_values,
                "input values changed"
            );
            mismatches.push("inputValues");
        }

        if record.input_files != *input_files {
            debug!(
                key,
                old = ?record.input_files,
                new = ?input_files,
                "input file list changed"
            );
            mismatches.push("inputFiles");
        }

        if record.input_files_state != *input_state {
            let changed = compute_changes(&record.input_files_state, input_state);
            debug!(key, changed = ?changed, "input files changed");
            mismatches.push("inputFilesState");
        }

        match path_list_state(&record.output_files, &record.excluded_output_files, false) {
            Ok(output_state) if output_state == record.output_files_state => {}
            Ok(output_state) => {
                let changed = compute_changes(&record.output_files_state, &output_state);
                debug!(key, changed = ?changed, "output files changed");
                mismatches.push("outputFilesState");
            }
            Err(e) => {
                debug!(key, error = %e, "output files cannot be inspected");
                mismatches.push("outputFilesState");
            }
        }

        let dynamic_changes = record.dynamic_inputs.changes();
        if !dynamic_changes.is_empty() {
            debug!(key, changed = ?dynamic_changes, "dynamic inputs changed");
            mismatches.push("dynamicInputs");
        }

        if mismatches.is_empty() {
            return false;
        }

        debug!(
            key,
            state_file = %state_file.display(),
            mismatches = ?mismatches,
            "state is outdated -> rebuilding"
        );
        true
    }

    /// Read back what was just written; on any disagreement drop the record and fail
    fn verify_written(&self, key: &str, held: &mut KeyLock, expected: &StateRecord) -> Result<()> {
        let problem = match self.store.read(held) {
            None => Some("state file cannot be read back after writing".to_string()),
            Some(actual) if actual != *expected => {
                Some("state file content differs from the written record".to_string())
            }
            Some(actual) => {
                match path_list_state(&actual.output_files, &actual.excluded_output_files, false) {
                    Ok(states) if states == actual.output_files_state => None,
                    Ok(states) => Some(format!(
                        "outputs changed while the state was written: {:?}",
                        compute_changes(&actual.output_files_state, &states)
                    )),
                    Err(e) => Some(format!("outputs cannot be re-read: {e}")),
                }
            }
        };

        let Some(reason) = problem else {
            return Ok(());
        };

        if let Err(e) = self.store.discard(held) {
            warn!(key, error = %e, "failed to delete inconsistent state file");
        }
        error!(key, state_file = %held.path().display(), reason = %reason, "inconsistent state");

        Err(IncrementalError::InternalInconsistency {
            key: key.to_string(),
            state_file: held.path().to_path_buf(),
            reason,
        })
    }
}

fn ensure_absolute(paths: &[PathBuf]) -> Result<()> {
    match paths.iter().find(|path| !path.is_absolute()) {
        Some(path) => Err(IncrementalError::RelativePath { path: path.clone() }),
        None => Ok(()),
    }
}
