//! Caching one structured value instead of raw output paths
//!
//! The value is encoded into the record's output values under a reserved
//! name. A cached value that no longer decodes (its type changed without a
//! code version bump) is recomputed instead of being reported.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use tracing::error;

use super::context::ExecutionContext;
use super::engine::{ExecutionResult, IncrementalCache};
use crate::error::{IncrementalError, Result};

/// Output value name holding the encoded value
pub const VALUE_OUTPUT: &str = "value";

/// Text encoding for cached values
pub trait ValueCodec<T> {
    fn encode(&self, value: &T) -> anyhow::Result<String>;
    fn decode(&self, encoded: &str) -> anyhow::Result<T>;
}

/// Encodes values as compact JSON via serde
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> ValueCodec<T> for JsonCodec {
    fn encode(&self, value: &T) -> anyhow::Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, encoded: &str) -> anyhow::Result<T> {
        Ok(serde_json::from_str(encoded)?)
    }
}

/// What a value-producing computation returns
#[derive(Debug, Clone)]
pub struct ValueExecution<T> {
    pub value: T,
    pub output_files: Vec<PathBuf>,
    pub excluded_output_files: BTreeSet<PathBuf>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl<T> ValueExecution<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            output_files: Vec::new(),
            excluded_output_files: BTreeSet::new(),
            expiration_time: None,
        }
    }

    pub fn with_output_files(mut self, output_files: Vec<PathBuf>) -> Self {
        self.output_files = output_files;
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueResult<T> {
    pub output_value: T,
    pub output_files: Vec<PathBuf>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl IncrementalCache {
    /// [`execute`](Self::execute) for a computation that produces one value.
    ///
    /// On a miss the freshly computed value is returned as is, without going
    /// through `codec.decode`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_value<T, C, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        key: &str,
        input_values: BTreeMap<String, String>,
        input_files: &[PathBuf],
        codec: &C,
        force_recalculation: bool,
        block: F,
    ) -> Result<ValueResult<T>>
    where
        C: ValueCodec<T>,
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<ValueExecution<T>>>,
    {
        let mut block = Some(block);
        let mut computed: Option<T> = None;
        let mut encode_failure: Option<IncrementalError> = None;
        let mut force = force_recalculation;

        loop {
            let pending = &mut block;
            let slot = &mut computed;
            let failure = &mut encode_failure;

            let outcome = self
                .execute(ctx, key, input_values.clone(), input_files, force, |inner| {
                    let block = pending.take();
                    async move {
                        let Some(block) = block else {
                            anyhow::bail!("computation for '{key}' was already consumed");
                        };
                        let execution = block(inner).await?;
                        let encoded = match codec.encode(&execution.value) {
                            Ok(encoded) => encoded,
                            Err(e) => {
                                *failure = Some(IncrementalError::Serialization {
                                    key: key.to_string(),
                                    reason: format!("{e:#}"),
                                });
                                anyhow::bail!("failed to encode value");
                            }
                        };
                        *slot = Some(execution.value);
                        Ok(ExecutionResult {
                            output_files: execution.output_files,
                            output_values: BTreeMap::from([(VALUE_OUTPUT.to_string(), encoded)]),
                            excluded_output_files: execution.excluded_output_files,
                            expiration_time: execution.expiration_time,
                        })
                    }
                })
                .await;

            if let Some(e) = encode_failure.take() {
                return Err(e);
            }
            let result = outcome?;

            if let Some(value) = computed.take() {
                return Ok(ValueResult {
                    output_value: value,
                    output_files: result.output_files,
                    expiration_time: result.expiration_time,
                });
            }

            let decoded = match result.output_values.get(VALUE_OUTPUT) {
                Some(encoded) => codec.decode(encoded),
                None => Err(anyhow::anyhow!("no '{VALUE_OUTPUT}' output in cached state")),
            };

            match decoded {
                Ok(value) => {
                    return Ok(ValueResult {
                        output_value: value,
                        output_files: result.output_files,
                        expiration_time: result.expiration_time,
                    })
                }
                Err(e) if !force => {
                    error!(
                        key,
                        error = %format!("{e:#}"),
                        "cached value cannot be decoded, recalculating"
                    );
                    force = true;
                }
                Err(e) => {
                    return Err(IncrementalError::Serialization {
                        key: key.to_string(),
                        reason: format!("{e:#}"),
                    })
                }
            }
        }
    }
}
