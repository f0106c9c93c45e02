//! Incremental computation cache
//!
//! Decides whether a named unit of work has to run again, runs it when it
//! does, and durably records what it consumed and produced.

pub mod changes;
pub mod context;
pub mod dynamic_inputs;
pub mod engine;
pub mod fingerprint;
pub mod lock;
pub mod record;
pub mod serialized;

pub use changes::{compute_changes, Change, ChangeType};
pub use context::ExecutionContext;
pub use dynamic_inputs::{
    clear_system_property, set_system_property, system_property, DynamicInputsRecorder,
    DynamicInputsState,
};
pub use engine::{CacheOptions, ExecuteResult, ExecutionResult, IncrementalCache};
pub use fingerprint::{path_list_state, PathStates, EMPTY_DIR, MISSING};
pub use record::{state_file_name, StateRecord, StateStore, FORMAT_VERSION};
pub use serialized::{JsonCodec, ValueCodec, ValueExecution, ValueResult, VALUE_OUTPUT};
