pub mod exec;
pub mod state;

use anyhow::{Context, Result};

use crate::cli::CommonArgs;
use incstate::config::{load_config, IncstateConfig};
use incstate::incremental::IncrementalCache;

/// Configuration from file, then `INCSTATE_*` variables, then command-line flags
pub fn load_settings(common: &CommonArgs) -> Result<IncstateConfig> {
    let mut config = load_config(common.config.as_deref())?;
    config.apply_env_overrides()?;

    if let Some(dir) = &common.state_dir {
        config.state.dir = dir.to_string_lossy().into_owned();
        config.base_dir = None;
    }

    config.validate()?;
    config.apply_properties();
    Ok(config)
}

pub fn open_cache(config: &IncstateConfig) -> Result<IncrementalCache> {
    let root = config.state_root()?;
    IncrementalCache::new(&root, config.cache_options()?)
        .with_context(|| format!("Failed to open state directory: {}", root.display()))
}
