use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::incremental::{set_system_property, CacheOptions};

/// Name of the project configuration file looked up from the working directory
pub const CONFIG_FILE_NAME: &str = "incstate.toml";

/// Complete incstate configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IncstateConfig {
    #[serde(default)]
    pub state: StateConfig,

    /// Extra system properties made visible to cached computations
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Directory of the file this was loaded from; relative paths resolve against it
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// State directory and engine behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Where record files live
    #[serde(default = "default_state_dir")]
    pub dir: String,

    /// Records written by a different code version are never reused
    #[serde(default = "default_code_version")]
    pub code_version: String,

    /// Re-read each record after writing it
    #[serde(default = "default_self_check")]
    pub self_check: bool,

    /// Maximum wait for the lock of a key (e.g. "30s", "5m"); unset waits forever
    #[serde(default)]
    pub lock_timeout: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            code_version: default_code_version(),
            self_check: default_self_check(),
            lock_timeout: None,
        }
    }
}

fn default_state_dir() -> String {
    ".incstate/state".to_string()
}

fn default_code_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_self_check() -> bool {
    cfg!(debug_assertions)
}

impl IncstateConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: IncstateConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);

        Ok(config)
    }

    /// Apply `INCSTATE_*` environment variables on top of file values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("INCSTATE_STATE_DIR") {
            self.state.dir = dir;
            self.base_dir = None;
        }
        if let Some(version) = lookup("INCSTATE_CODE_VERSION") {
            self.state.code_version = version;
        }
        if let Some(value) = lookup("INCSTATE_SELF_CHECK") {
            self.state.self_check = parse_bool(&value)
                .ok_or_else(|| anyhow!("INCSTATE_SELF_CHECK must be true or false, got '{value}'"))?;
        }
        if let Some(timeout) = lookup("INCSTATE_LOCK_TIMEOUT") {
            self.state.lock_timeout = Some(timeout);
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.state.dir.trim().is_empty() {
            anyhow::bail!("state.dir must be set");
        }

        if self.state.code_version.trim().is_empty() {
            anyhow::bail!("state.code_version must not be empty");
        }

        if let Some(timeout) = &self.state.lock_timeout {
            parse_duration(timeout)
                .with_context(|| format!("state.lock_timeout is invalid: '{timeout}'"))?;
        }

        if let Some(name) = self.properties.keys().find(|name| name.trim().is_empty()) {
            anyhow::bail!("properties contains an empty name: '{name}'");
        }

        Ok(())
    }

    /// Absolute state root
    pub fn state_root(&self) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.state.dir);
        if dir.is_absolute() {
            return Ok(dir);
        }
        let base = match &self.base_dir {
            Some(base) if !base.as_os_str().is_empty() => base.clone(),
            _ => std::env::current_dir().context("Failed to get current directory")?,
        };
        Ok(base.join(dir))
    }

    pub fn cache_options(&self) -> Result<CacheOptions> {
        let lock_timeout = self
            .state
            .lock_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()?;

        Ok(CacheOptions {
            code_version: self.state.code_version.clone(),
            self_check: self.state.self_check,
            lock_timeout,
        })
    }

    /// Seed `[properties]` into the process-wide system property table
    pub fn apply_properties(&self) {
        for (name, value) in &self.properties {
            set_system_property(name.clone(), value.clone());
        }
    }
}

/// Discovers incstate configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = Some(start_dir);
    while let Some(dir) = current {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        current = dir.parent();
    }

    dirs::home_dir()
        .map(|home| home.join(".config/incstate/config.toml"))
        .filter(|global| global.is_file())
}

/// Loads configuration from `explicit_path`, or by discovery from the working directory.
///
/// Missing configuration is not an error; defaults are used.
pub fn load_config(explicit_path: Option<&Path>) -> Result<IncstateConfig> {
    let path = match explicit_path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir()
                .context("Failed to get current directory for config discovery")?;
            discover_config(&cwd)
        }
    };

    match path {
        Some(path) => {
            tracing::debug!(config = %path.display(), "loading configuration");
            IncstateConfig::from_file(path)
        }
        None => Ok(IncstateConfig::default()),
    }
}

/// Parse a duration like "10s", "30m", "1h" or "7d"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let Some((unit_start, _)) = s.char_indices().last() else {
        return Err(anyhow!("Empty duration string"));
    };

    let (num_str, unit) = s.split_at(unit_start);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let seconds = match unit {
        "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(3600),
        "d" => num.checked_mul(86400),
        _ => return Err(anyhow!("Invalid duration unit: {}. Use: s, m, h, d", unit)),
    };

    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("Duration out of range: {}", s))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
