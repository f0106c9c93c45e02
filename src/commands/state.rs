/// `incstate state` command implementation
///
/// Lists, shows and deletes state records.
use anyhow::{Context, Result};
use tracing::info;

use crate::cli::{CommonArgs, StateArgs, StateCommands};
use crate::cli_utils::incstate_prefix;
use crate::commands::{load_settings, open_cache};
use incstate::incremental::{StateRecord, StateStore};
use incstate::logging::operations;

pub async fn run(common: &CommonArgs, args: &StateArgs) -> Result<()> {
    let config = load_settings(common)?;
    let cache = open_cache(&config)?;
    let store = cache.store();

    match &args.command {
        StateCommands::List { verbose } => list(store, *verbose),
        StateCommands::Show { key } => show(store, key),
        StateCommands::Clean { key, all } => clean(store, key.as_deref(), *all).await,
    }
}

/// List all state records
fn list(store: &StateStore, verbose: bool) -> Result<()> {
    let files = store.list().context("Failed to list state records")?;
    info!(operation = operations::STATE_LIST, count = files.len(), "listing state records");

    if files.is_empty() {
        println!("No state records in {}", store.root().display());
        return Ok(());
    }

    println!("State records ({} entries):", files.len());
    println!();

    for path in files {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match StateStore::read_record_file(&path)? {
            Some(record) => {
                println!("  {}", name);
                println!("    Code version: {}", record.code_version);
                println!("    Outputs: {}", record.output_files.len());
                match record.expiration_time {
                    Some(expires_at) => {
                        println!("    Expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S"))
                    }
                    None => println!("    Expires: Never"),
                }

                if verbose {
                    print_details(&record);
                }
            }
            None => println!("  {} (unreadable, will be rebuilt)", name),
        }
        println!();
    }

    Ok(())
}

fn print_details(record: &StateRecord) {
    for (name, value) in &record.input_values {
        println!("    Input value: {} = {}", name, value);
    }
    for path in &record.input_files {
        println!("    Input: {}", path.display());
    }
    for path in &record.output_files {
        println!("    Output: {}", path.display());
    }
    for name in record.dynamic_inputs.environment_variables.keys() {
        println!("    Reads env: {}", name);
    }
    for name in record.dynamic_inputs.system_properties.keys() {
        println!("    Reads property: {}", name);
    }
    for path in record.dynamic_inputs.paths_existence.keys() {
        println!("    Checks path: {}", path.display());
    }
}

/// Print the record of one key as JSON
fn show(store: &StateStore, key: &str) -> Result<()> {
    let path = store.state_file(key);
    info!(operation = operations::STATE_SHOW, key, state_file = %path.display(), "showing state record");

    match StateStore::read_record_file(&path)? {
        Some(record) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("Failed to encode state record")?
            );
            Ok(())
        }
        None => anyhow::bail!("No state recorded for key '{}' ({})", key, path.display()),
    }
}

/// Delete the record of one key, or all records
async fn clean(store: &StateStore, key: Option<&str>, all: bool) -> Result<()> {
    if all {
        let removed = store.clear().await.context("Failed to delete state records")?;
        info!(operation = operations::STATE_CLEAN, removed, "deleted all state records");
        println!("{} Deleted {} state records.", incstate_prefix(), removed);
        return Ok(());
    }

    let Some(key) = key else {
        anyhow::bail!("Specify --all to delete all state records, or provide a key");
    };

    store
        .remove(key)
        .await
        .with_context(|| format!("Failed to delete state of '{}'", key))?;
    info!(operation = operations::STATE_CLEAN, key, "deleted state record");
    println!("{} Deleted state of: {}", incstate_prefix(), key);

    Ok(())
}
