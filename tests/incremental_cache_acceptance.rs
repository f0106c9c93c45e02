/// Acceptance tests for the incremental cache
///
/// These tests drive `IncrementalCache` the way a build orchestrator would:
/// real files on disk, nested cached steps, concurrent callers.
mod common;

use common::TestProject;
use incstate::incremental::set_system_property;
use incstate::{
    Change, ChangeType, ExecutionContext, ExecutionResult, IncrementalCache, IncrementalError,
    JsonCodec, ValueExecution,
};
use serial_test::serial;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn values(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A "compiler" that concatenates its inputs into one output file
async fn compile(
    cache: &IncrementalCache,
    ctx: &ExecutionContext,
    key: &str,
    sources: &[PathBuf],
    output: &Path,
    runs: &AtomicUsize,
) -> incstate::Result<incstate::ExecuteResult> {
    cache
        .execute(ctx, key, values(&[("jdk", "17")]), sources, false, |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            let mut compiled = String::new();
            for source in sources {
                compiled.push_str(&fs::read_to_string(source)?);
            }
            fs::create_dir_all(output.parent().unwrap())?;
            fs::write(output, compiled)?;
            Ok::<_, anyhow::Error>(ExecutionResult::new(vec![output.to_path_buf()]))
        })
        .await
}

#[tokio::test]
async fn test_worked_scenario() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let source = project.create_file("src/Main.kt", &"x".repeat(100));
    let output = project.path("out/Main.class");
    let runs = AtomicUsize::new(0);
    let sources = [source];

    // Call 1: block runs, output is new
    let first = compile(&cache, &ctx, "compile:mod1", &sources, &output, &runs)
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.changes,
        vec![Change::new(output.to_string_lossy(), ChangeType::Created)]
    );

    // Call 2: nothing changed
    let second = compile(&cache, &ctx, "compile:mod1", &sources, &output, &runs)
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(second.changes.is_empty());
    assert_eq!(second.output_files, first.output_files);

    // Call 3: source mtime moves, block runs again
    project.touch("src/Main.kt", Duration::from_secs(60));
    let third = compile(&cache, &ctx, "compile:mod1", &sources, &output, &runs)
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(third
        .changes
        .iter()
        .all(|change| change.path == output.to_string_lossy()
            && change.change_type == ChangeType::Modified));
}

#[tokio::test]
async fn test_unlisted_file_has_no_effect() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let listed = project.create_file("src/a.kt", "a");
    let unlisted = project.create_file("src/b.kt", "b");
    let output = project.path("out/a.class");
    let runs = AtomicUsize::new(0);
    let sources = [listed];

    compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();
    fs::write(&unlisted, "b changed").unwrap();
    compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_directory_input_tracks_nested_files() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    project.create_file("src/pkg/a.kt", "a");
    let output = &project.path("out/classes");
    let runs = &AtomicUsize::new(0);
    let src_dir = [project.path("src")];

    let build = || {
        cache.execute(&ctx, "k", values(&[]), &src_dir, false, |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(output)?;
            Ok::<_, anyhow::Error>(ExecutionResult::new(vec![output.clone()]))
        })
    };

    build().await.unwrap();
    build().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    project.create_file("src/pkg/new.kt", "new");
    build().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_output_tampering_self_heals() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let sources = [project.create_file("src/a.kt", "source")];
    let output = project.path("out/a.class");
    let runs = AtomicUsize::new(0);

    compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();

    fs::write(&output, "tampered with").unwrap();
    compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(project.read_file("out/a.class"), "source");

    fs::remove_file(&output).unwrap();
    let result = compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.changes,
        vec![Change::new(output.to_string_lossy(), ChangeType::Modified)]
    );
}

#[tokio::test]
#[serial]
async fn test_nested_env_read_invalidates_outer() {
    std::env::set_var("INCSTATE_ACCEPT_BAR", "one");
    let project = TestProject::new();
    let cache = &project.cache();
    let ctx = ExecutionContext::new();
    let outer_runs = &AtomicUsize::new(0);
    let inner_runs = &AtomicUsize::new(0);

    let run_outer = || {
        cache.execute(&ctx, "outer", values(&[]), &[], false, |ctx| async move {
            outer_runs.fetch_add(1, Ordering::SeqCst);
            cache
                .execute(&ctx, "inner", values(&[]), &[], false, |ctx| async move {
                    inner_runs.fetch_add(1, Ordering::SeqCst);
                    let bar = ctx.read_env("INCSTATE_ACCEPT_BAR").unwrap_or_default();
                    Ok(ExecutionResult::default().with_output_value("bar", bar))
                })
                .await?;
            Ok::<_, anyhow::Error>(ExecutionResult::default())
        })
    };

    run_outer().await.unwrap();
    run_outer().await.unwrap();
    assert_eq!(outer_runs.load(Ordering::SeqCst), 1);
    assert_eq!(inner_runs.load(Ordering::SeqCst), 1);

    std::env::set_var("INCSTATE_ACCEPT_BAR", "two");
    let rerun = run_outer().await.unwrap();
    assert_eq!(outer_runs.load(Ordering::SeqCst), 2);
    assert_eq!(inner_runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        rerun.changes,
        vec![Change::new("env:INCSTATE_ACCEPT_BAR", ChangeType::Modified)]
    );

    std::env::remove_var("INCSTATE_ACCEPT_BAR");
}

#[tokio::test]
#[serial]
async fn test_nested_cache_hit_still_propagates() {
    std::env::set_var("INCSTATE_ACCEPT_HIT", "1");
    let project = TestProject::new();
    let cache = &project.cache();
    let ctx = ExecutionContext::new();
    let outer_runs = &AtomicUsize::new(0);

    let inner = |ctx: ExecutionContext| async move {
        cache
            .execute(&ctx, "inner", values(&[]), &[], false, |ctx| async move {
                ctx.read_env("INCSTATE_ACCEPT_HIT");
                Ok(ExecutionResult::default())
            })
            .await
    };

    // Inner entry exists before the outer one is ever built
    inner(ExecutionContext::new()).await.unwrap();

    let run_outer = || {
        cache.execute(&ctx, "outer", values(&[]), &[], false, |ctx| async move {
            outer_runs.fetch_add(1, Ordering::SeqCst);
            inner(ctx).await?;
            Ok::<_, anyhow::Error>(ExecutionResult::default())
        })
    };

    run_outer().await.unwrap();
    std::env::set_var("INCSTATE_ACCEPT_HIT", "2");
    run_outer().await.unwrap();
    assert_eq!(outer_runs.load(Ordering::SeqCst), 2);

    std::env::remove_var("INCSTATE_ACCEPT_HIT");
}

#[tokio::test]
#[serial]
async fn test_system_property_and_path_existence_are_tracked() {
    set_system_property("incstate.accept.profile", "debug");
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let marker = &project.path("marker");
    let runs = &AtomicUsize::new(0);

    let run = || {
        cache.execute(&ctx, "k", values(&[]), &[], false, |ctx| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            ctx.read_system_property("incstate.accept.profile");
            ctx.check_path_existence(marker);
            Ok(ExecutionResult::default())
        })
    };

    run().await.unwrap();
    run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    fs::write(marker, "").unwrap();
    let result = run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        result.changes,
        vec![Change::new(marker.to_string_lossy(), ChangeType::Created)]
    );

    set_system_property("incstate.accept.profile", "release");
    let result = run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.changes,
        vec![Change::new("property:incstate.accept.profile", ChangeType::Modified)]
    );
}

#[tokio::test]
async fn test_missing_declared_output_leaves_record_unchanged() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let sources = [project.create_file("src/a.kt", "a")];
    let output = project.path("out/a.class");
    let runs = AtomicUsize::new(0);
    compile(&cache, &ctx, "k", &sources, &output, &runs).await.unwrap();

    let state_file = cache.store().state_file("k");
    let before = fs::read(&state_file).unwrap();

    let missing = project.path("out/never-written.class");
    let missing_ref = &missing;
    let err = cache
        .execute(&ctx, "k", values(&[("jdk", "21")]), &sources, false, |_| async move {
            Ok(ExecutionResult::new(vec![missing_ref.clone()]))
        })
        .await
        .unwrap_err();

    match &err {
        IncrementalError::MissingOutput {
            key,
            path,
            state_file: reported,
        } => {
            assert_eq!(key, "k");
            assert_eq!(path, &missing);
            assert_eq!(reported, &state_file);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("never-written.class"));
    assert_eq!(fs::read(&state_file).unwrap(), before);
}

#[tokio::test]
async fn test_expiration() {
    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();
    let runs = &AtomicUsize::new(0);

    let run = |expires_in: chrono::Duration| {
        cache.execute(&ctx, "download", values(&[]), &[], false, move |_| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::default().with_expiration_time(chrono::Utc::now() + expires_in))
        })
    };

    run(chrono::Duration::hours(1)).await.unwrap();
    run(chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Rewrite with an expiration that has already passed
    cache
        .execute(&ctx, "download", values(&[]), &[], true, |_| async {
            Ok(ExecutionResult::default()
                .with_expiration_time(chrono::Utc::now() - chrono::Duration::seconds(1)))
        })
        .await
        .unwrap();
    run(chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_run_block_once() {
    let project = TestProject::new();
    let cache = Arc::new(project.cache());
    let output = project.path("out/shared.jar");
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let output = output.clone();
        let runs = runs.clone();
        handles.push(tokio::spawn(async move {
            cache
                .execute(&ExecutionContext::new(), "package", BTreeMap::new(), &[], false, |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    fs::create_dir_all(output.parent().unwrap())?;
                    fs::write(&output, "jar")?;
                    Ok::<_, anyhow::Error>(ExecutionResult::new(vec![output]))
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_keys_are_independent() {
    let project = TestProject::new();
    let cache = Arc::new(project.cache());
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .execute(&ExecutionContext::new(), "slow", BTreeMap::new(), &[], false, |_| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(ExecutionResult::default())
                })
                .await
        })
    };

    started_rx.await.unwrap();
    let fast = tokio::time::timeout(
        Duration::from_secs(5),
        cache.execute(&ExecutionContext::new(), "fast", BTreeMap::new(), &[], false, |_| async {
            Ok(ExecutionResult::default())
        }),
    )
    .await
    .expect("a different key must not wait for 'slow'");
    assert!(fast.is_ok());

    release_tx.send(()).unwrap();
    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancelled_execution_releases_lock() {
    let project = TestProject::new();
    let cache = Arc::new(project.cache());

    let stuck = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .execute(&ExecutionContext::new(), "k", BTreeMap::new(), &[], false, |_| async {
                    std::future::pending::<()>().await;
                    Ok(ExecutionResult::default())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    stuck.abort();
    assert!(stuck.await.unwrap_err().is_cancelled());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        cache.execute(&ExecutionContext::new(), "k", BTreeMap::new(), &[], false, |_| async {
            Ok(ExecutionResult::default())
        }),
    )
    .await
    .expect("lock of a cancelled execution must be released");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_state_survives_new_cache_instance() {
    let project = TestProject::new();
    let sources = [project.create_file("src/a.kt", "a")];
    let output = project.path("out/a.class");
    let runs = AtomicUsize::new(0);
    let ctx = ExecutionContext::new();

    compile(&project.cache(), &ctx, "k", &sources, &output, &runs).await.unwrap();
    compile(&project.cache(), &ctx, "k", &sources, &output, &runs).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_serialized_value_recovers_from_schema_drift() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct V1 {
        name: String,
    }
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct V2 {
        names: Vec<String>,
    }

    let project = TestProject::new();
    let cache = project.cache();
    let ctx = ExecutionContext::new();

    cache
        .execute_value(&ctx, "resolve", values(&[]), &[], &JsonCodec, false, |_| async {
            Ok(ValueExecution::new(V1 {
                name: "a".to_string(),
            }))
        })
        .await
        .unwrap();

    let runs = &AtomicUsize::new(0);
    for _ in 0..2 {
        let result = cache
            .execute_value(&ctx, "resolve", values(&[]), &[], &JsonCodec, false, |_| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ValueExecution::new(V2 {
                    names: vec!["a".to_string(), "b".to_string()],
                }))
            })
            .await
            .unwrap();
        assert_eq!(result.output_value.names.len(), 2);
    }
    // Recomputed once after the decode failure, then served from the cache
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
