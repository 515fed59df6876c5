#![cfg(feature = "sqlite-persistence")]
//! End-to-end durability scenarios against the SQLite step store: fresh runs,
//! replay, loop disambiguation, recovery from a crash between execute and
//! commit, concurrent reservation, and failure-then-resume.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::params;
use stele_engine::{
    DurableContext, DurableEngine, EngineError, EngineOptions, SqliteStepStore, StepError,
    StepStatus, StepStore,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_db_path(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("stele-durability-{name}-{ts}.sqlite"))
}

fn engine_at(path: &PathBuf) -> DurableEngine {
    DurableEngine::open_sqlite(path, EngineOptions::default()).unwrap()
}

#[derive(Clone, Default)]
struct CallCounts {
    a: Arc<AtomicUsize>,
    b: Arc<AtomicUsize>,
}

/// The two-step procedure used by the fresh-run / replay / crash scenarios.
/// One definition so every engine replays through the same call sites.
fn two_step_workflow(ctx: &DurableContext, calls: &CallCounts) -> Result<String, EngineError> {
    let a = {
        let counter = calls.a.clone();
        ctx.step("a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StepError>(1_i64)
        })?
    };
    assert_eq!(a, 1);
    let counter = calls.b.clone();
    ctx.step("b", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, StepError>("x".to_string())
    })
}

#[test]
fn fresh_run_commits_and_replay_skips_side_effects() {
    init_tracing();
    let path = test_db_path("replay");
    let calls = CallCounts::default();

    let first = engine_at(&path)
        .run("wf1", |ctx| two_step_workflow(ctx, &calls))
        .unwrap();
    assert_eq!(first, "x");
    assert_eq!(calls.a.load(Ordering::SeqCst), 1);
    assert_eq!(calls.b.load(Ordering::SeqCst), 1);

    let store = SqliteStepStore::new(&path);
    let records = store.scan("wf1", Some(StepStatus::Completed)).unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        let parts: Vec<&str> = record.step_key.split("::").collect();
        assert_eq!(parts.len(), 3, "store key is step_id::callsite::sequence");
        assert_eq!(parts[0], record.step_id);
        assert_eq!(parts[1].len(), 8, "callsite hash is fixed-width hex");
        assert_eq!(parts[2], "1");
        assert_eq!(record.attempt, 1);
    }
    let a_row = records.iter().find(|r| r.step_id == "a").unwrap();
    assert_eq!(a_row.output_json.as_deref(), Some("1"));
    let b_row = records.iter().find(|r| r.step_id == "b").unwrap();
    assert_eq!(b_row.output_json.as_deref(), Some("\"x\""));

    // A different engine instance (fresh worker id) against the same store.
    let second = engine_at(&path)
        .run("wf1", |ctx| two_step_workflow(ctx, &calls))
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(calls.a.load(Ordering::SeqCst), 1, "step a replayed from cache");
    assert_eq!(calls.b.load(Ordering::SeqCst), 1, "step b replayed from cache");
}

#[test]
fn loop_iterations_disambiguate_and_replay_in_order() {
    init_tracing();
    let path = test_db_path("loop");
    let executions = Arc::new(AtomicUsize::new(0));

    let notify_loop = |ctx: &DurableContext| -> Result<Vec<i64>, EngineError> {
        let mut out = Vec::new();
        for i in 0..3_i64 {
            let executions = executions.clone();
            out.push(ctx.step("notify", move || {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StepError>(i)
            })?);
        }
        Ok(out)
    };

    assert_eq!(engine_at(&path).run("wf-loop", notify_loop).unwrap(), vec![0, 1, 2]);
    assert_eq!(executions.load(Ordering::SeqCst), 3);

    let store = SqliteStepStore::new(&path);
    let records = store.scan("wf-loop", Some(StepStatus::Completed)).unwrap();
    let mut keys: Vec<&str> = records.iter().map(|r| r.step_key.as_str()).collect();
    keys.sort();
    assert_eq!(records.len(), 3);
    assert!(keys[0].starts_with("notify::") && keys[0].ends_with("::1"));
    assert!(keys[1].ends_with("::2"));
    assert!(keys[2].ends_with("::3"));

    assert_eq!(engine_at(&path).run("wf-loop", notify_loop).unwrap(), vec![0, 1, 2]);
    assert_eq!(
        executions.load(Ordering::SeqCst),
        3,
        "replay invokes the loop body zero times"
    );
}

/// A crash after execute but before commit leaves the row RUNNING under a
/// dead owner. The next run reclaims it once the lease is stale, re-executes
/// the side effect, and completes normally.
#[test]
fn crash_between_execute_and_commit_is_recovered_on_the_next_run() {
    init_tracing();
    let path = test_db_path("crash");
    let calls = CallCounts::default();

    engine_at(&path)
        .run("wf-crash", |ctx| two_step_workflow(ctx, &calls))
        .unwrap();

    // Reproduce the post-crash store state: step b never committed and its
    // owner will never heartbeat again.
    let stale = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
        - 60_000;
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute(
        "UPDATE steps
         SET status = 'RUNNING', owner = 'worker-dead',
             output_json = NULL, output_type = NULL, updated_at_ms = ?1
         WHERE workflow_id = ?2 AND step_id = 'b'",
        params![stale, "wf-crash"],
    )
    .unwrap();

    let resumed = engine_at(&path)
        .run("wf-crash", |ctx| two_step_workflow(ctx, &calls))
        .unwrap();
    assert_eq!(resumed, "x");
    assert_eq!(calls.a.load(Ordering::SeqCst), 1, "step a stays cached");
    assert_eq!(
        calls.b.load(Ordering::SeqCst),
        2,
        "the interrupted step re-executes (idempotency is the caller's concern)"
    );

    let store = SqliteStepStore::new(&path);
    let records = store.scan("wf-crash", Some(StepStatus::Completed)).unwrap();
    assert_eq!(records.len(), 2);
    let b_row = records.iter().find(|r| r.step_id == "b").unwrap();
    assert!(b_row.attempt >= 2, "reclaim increments the attempt");
}

fn contended_workflow(
    ctx: &DurableContext,
    hold: Duration,
    executions: Arc<AtomicUsize>,
) -> Result<i64, EngineError> {
    ctx.step("charge", move || {
        executions.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(hold);
        Ok::<_, StepError>(41)
    })
}

/// Two workers race on one fresh key: exactly one executes, the other waits
/// through the live lease and replays the winner's output.
#[test]
fn concurrent_workers_execute_a_contended_step_exactly_once() {
    init_tracing();
    let path = test_db_path("contended");
    engine_at(&path); // initialize the schema before both workers start
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for (start_delay, hold) in [
        (Duration::ZERO, Duration::from_millis(300)),
        (Duration::from_millis(100), Duration::ZERO),
    ] {
        let path = path.clone();
        let executions = executions.clone();
        handles.push(std::thread::spawn(move || {
            std::thread::sleep(start_delay);
            engine_at(&path)
                .run("wf-race", |ctx| {
                    contended_workflow(ctx, hold, executions.clone())
                })
                .unwrap()
        }));
    }
    let values: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(values, vec![41, 41]);
    assert_eq!(
        executions.load(Ordering::SeqCst),
        1,
        "exactly one worker executes the step body"
    );

    let store = SqliteStepStore::new(&path);
    let records = store.scan("wf-race", Some(StepStatus::Completed)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt, 1);
}

#[test]
fn failed_step_halts_the_run_and_resumes_on_the_next_one() {
    init_tracing();
    let path = test_db_path("failure");
    let attempts = Arc::new(AtomicUsize::new(0));

    let flaky = |ctx: &DurableContext| -> Result<i64, EngineError> {
        let attempts = attempts.clone();
        ctx.step("c", move || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err::<i64, StepError>("directory service unavailable".into())
            } else {
                Ok(12)
            }
        })
    };

    let err = engine_at(&path).run("wf-flaky", flaky).unwrap_err();
    match err {
        EngineError::StepFailed { source, .. } => {
            assert_eq!(source.to_string(), "directory service unavailable");
        }
        other => panic!("expected StepFailed, got {other}"),
    }
    let store = SqliteStepStore::new(&path);
    let failed = store.scan("wf-flaky", Some(StepStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("directory service unavailable")
    );

    assert_eq!(engine_at(&path).run("wf-flaky", flaky).unwrap(), 12);
    let completed = store.scan("wf-flaky", Some(StepStatus::Completed)).unwrap();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].attempt >= 2);
}

#[test]
fn void_steps_round_trip_through_the_store() {
    init_tracing();
    let path = test_db_path("void");
    let pings = Arc::new(AtomicUsize::new(0));

    let ping = |ctx: &DurableContext| -> Result<(), EngineError> {
        let pings = pings.clone();
        ctx.step("ping", move || {
            pings.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StepError>(())
        })
    };

    engine_at(&path).run("wf-void", ping).unwrap();
    engine_at(&path).run("wf-void", ping).unwrap();
    assert_eq!(pings.load(Ordering::SeqCst), 1);

    let store = SqliteStepStore::new(&path);
    let records = store.scan("wf-void", Some(StepStatus::Completed)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].output_json, None);
    assert_eq!(records[0].output_type.as_deref(), Some("void"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_steps_replay_without_reexecution() {
    init_tracing();
    let path = test_db_path("parallel");
    let executions = Arc::new(AtomicUsize::new(0));

    let fan_out = |ctx: &DurableContext| {
        let left = {
            let executions = executions.clone();
            ctx.step_async("left", move || {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StepError>(10_i64)
            })
        };
        let right = {
            let executions = executions.clone();
            ctx.step_async("right", move || {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StepError>(20_i64)
            })
        };
        (left, right)
    };

    let engine = engine_at(&path);
    let (left, right) = engine.run("wf-fan", |ctx| Ok(fan_out(ctx))).unwrap();
    let total = left.await.unwrap().unwrap() + right.await.unwrap().unwrap();
    assert_eq!(total, 30);
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    let engine = engine_at(&path);
    let (left, right) = engine.run("wf-fan", |ctx| Ok(fan_out(ctx))).unwrap();
    let total = left.await.unwrap().unwrap() + right.await.unwrap().unwrap();
    assert_eq!(total, 30);
    assert_eq!(
        executions.load(Ordering::SeqCst),
        2,
        "parallel steps replay from cache"
    );
}
