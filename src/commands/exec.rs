/// `incstate exec` command implementation
///
/// Runs a shell command as a cached computation. The command line itself is
/// an input value, so editing it invalidates the state.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tracing::{debug, error};

use crate::cli::{CommonArgs, ExecArgs};
use crate::cli_utils::{absolutize, incstate_prefix};
use crate::commands::{load_settings, open_cache};
use incstate::config::parse_duration;
use incstate::incremental::{Change, ExecutionContext, ExecutionResult};
use incstate::logging::status;
use incstate::IncrementalError;

/// Input value holding the command line
const COMMAND_INPUT: &str = "exec.command";

#[derive(Debug, Default)]
struct Outcome {
    ran: bool,
    exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecReport<'a> {
    key: &'a str,
    status: &'a str,
    output_files: &'a [PathBuf],
    output_values: &'a BTreeMap<String, String>,
    changes: &'a [Change],
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration_time: Option<DateTime<Utc>>,
}

pub async fn run(common: &CommonArgs, args: ExecArgs) -> Result<()> {
    let config = load_settings(common)?;
    let cache = open_cache(&config)?;
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let input_files = absolutize(&cwd, &args.input_files);
    let outputs = absolutize(&cwd, &args.outputs);
    let excluded: BTreeSet<PathBuf> = absolutize(&cwd, &args.excluded_outputs)
        .into_iter()
        .collect();

    let mut input_values: BTreeMap<String, String> = args.input_values.iter().cloned().collect();
    input_values.insert(
        COMMAND_INPUT.to_string(),
        serde_json::to_string(&args.command).context("Failed to encode command line")?,
    );

    let expiration_time = match args.ttl.as_deref() {
        Some(ttl) => {
            let ttl = parse_duration(ttl).with_context(|| format!("Invalid --ttl: '{ttl}'"))?;
            Some(Utc::now() + chrono::Duration::from_std(ttl).context("--ttl is too large")?)
        }
        None => None,
    };

    let mut outcome = Outcome::default();
    let slot = &mut outcome;
    let (command, env_names, json) = (&args.command, &args.env, args.json);
    let workdir = cwd.as_path();

    let result = cache
        .execute(
            &ExecutionContext::new(),
            &args.key,
            input_values,
            &input_files,
            args.force,
            |ctx| async move {
                slot.ran = true;
                let exit = run_command(&ctx, command, env_names, workdir, json).await?;
                if !exit.success() {
                    slot.exit_code = Some(exit.code().unwrap_or(1));
                    anyhow::bail!("command exited with {exit}");
                }

                let mut result = ExecutionResult::new(outputs);
                result.excluded_output_files = excluded;
                result.expiration_time = expiration_time;
                Ok(result)
            },
        )
        .await;

    let result = match (result, outcome.exit_code) {
        (Ok(result), _) => result,
        (Err(IncrementalError::Computation { .. }), Some(code)) => {
            error!(
                key = %args.key,
                status = status::ERROR,
                exit_code = code,
                "command failed, no state recorded"
            );
            std::process::exit(code);
        }
        (Err(e), _) => {
            return Err(e).with_context(|| format!("Failed to execute '{}'", args.key));
        }
    };

    let report = ExecReport {
        key: &args.key,
        status: if outcome.ran {
            status::EXECUTED
        } else {
            status::UP_TO_DATE
        },
        output_files: &result.output_files,
        output_values: &result.output_values,
        changes: &result.changes,
        expiration_time: result.expiration_time,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode result")?
        );
    } else {
        print_report(&report);
    }

    Ok(())
}

async fn run_command(
    ctx: &ExecutionContext,
    command: &[String],
    env_names: &[String],
    cwd: &Path,
    json: bool,
) -> Result<ExitStatus> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("No command given");
    };

    let program_path = which::which(program).unwrap_or_else(|e| {
        debug!(program = %program, error = %e, "not found in PATH, trying as-is");
        PathBuf::from(program)
    });

    let mut cmd = tokio::process::Command::new(&program_path);
    cmd.args(args).current_dir(cwd);

    for name in env_names {
        match ctx.read_env(name) {
            Some(value) => {
                cmd.env(name, value);
            }
            None => {
                cmd.env_remove(name);
            }
        }
    }

    // Keep stdout parseable
    if json {
        cmd.stdout(std::io::stderr());
    }

    debug!(command = ?command, "running command");
    cmd.status()
        .await
        .with_context(|| format!("Failed to spawn command: {program}"))
}

fn print_report(report: &ExecReport<'_>) {
    println!("{} {}: {}", incstate_prefix(), report.key, report.status);

    if !report.output_files.is_empty() {
        println!("  Outputs:");
        for path in report.output_files {
            println!("    {}", path.display());
        }
    }

    if !report.changes.is_empty() {
        println!("  Changes:");
        for change in report.changes {
            println!("    {change}");
        }
    }

    if let Some(expires_at) = report.expiration_time {
        println!("  Expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S"));
    }
}
