// Library interface for incstate
// The binary and integration tests use these modules directly

pub mod config;
pub mod error;
pub mod incremental;
pub mod logging;

// Re-export commonly used types
pub use config::{discover_config, load_config, IncstateConfig};
pub use error::{IncrementalError, Result};
pub use incremental::{
    CacheOptions, Change, ChangeType, ExecuteResult, ExecutionContext, ExecutionResult,
    IncrementalCache, JsonCodec, StateStore, ValueCodec, ValueExecution, ValueResult,
};
