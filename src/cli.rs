use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// incstate - Incremental execution cache
///
/// Runs a command only when its declared inputs, its outputs or the
/// environment it read have changed since the last successful run.
#[derive(Parser, Debug)]
#[command(name = "incstate")]
#[command(author = "Incstate Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental execution cache", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Configuration arguments shared across commands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Config file path (default: discover incstate.toml upwards)
    #[arg(short = 'c', long, global = true, env = "INCSTATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding state records
    #[arg(long, global = true, env = "INCSTATE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset (trace|debug|info|warn|error)
    #[arg(long, global = true, env = "INCSTATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command unless its recorded state is still up to date
    Exec(ExecArgs),

    /// Inspect and clean state records
    State(StateArgs),
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Cache key naming this unit of work
    #[arg(long)]
    pub key: String,

    /// Input value (repeatable)
    #[arg(long = "input-value", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    pub input_values: Vec<(String, String)>,

    /// Input file or directory (repeatable)
    #[arg(long = "input-file", value_name = "PATH")]
    pub input_files: Vec<PathBuf>,

    /// Output file or directory the command produces (repeatable)
    #[arg(long = "output", value_name = "PATH")]
    pub outputs: Vec<PathBuf>,

    /// Path under an output that is not tracked (repeatable)
    #[arg(long = "exclude-output", value_name = "PATH")]
    pub excluded_outputs: Vec<PathBuf>,

    /// Environment variable the command depends on (repeatable)
    #[arg(long = "env", value_name = "VAR")]
    pub env: Vec<String>,

    /// Time after which the recorded state expires (e.g. "30m", "1h", "7d")
    #[arg(long)]
    pub ttl: Option<String>,

    /// Run the command even if the state is up to date
    #[arg(long)]
    pub force: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to run, after `--`
    #[arg(last = true, required = true, num_args = 1.., value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommands,
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List state records
    List {
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the state record of a key
    Show {
        /// Cache key
        key: String,
    },

    /// Delete state records
    Clean {
        /// Cache key (omit together with --all to delete everything)
        key: Option<String>,

        /// Delete all records
        #[arg(long)]
        all: bool,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}
