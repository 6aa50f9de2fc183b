//! End-to-end scenarios: memoisation, persistence, restarts, concurrent
//! workers, error propagation and dynamic graphs.

use std::sync::{Arc, LazyLock, Mutex};

use anyhow::Context;
use memograph::{Cache, Error, Plugin, Rule, Session, TaskView, Value};

static TOTAL: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("total", |_ctx, args| {
        let xs = args[0].as_seq().context("total expects a sequence")?;
        Ok(Value::from(xs.iter().filter_map(Value::as_int).sum::<i64>()))
    })
});

static FIB: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("fib", |ctx, args| {
        let n = args[0].as_int().context("fib expects an integer")?;
        if n < 2 {
            return Ok(Value::from(n));
        }
        let a = ctx.spawn(&FIB, [Value::from(n - 1)])?;
        let b = ctx.spawn(&FIB, [Value::from(n - 2)])?;
        let total = ctx.spawn(&TOTAL, [Value::seq([a.into(), b.into()])])?;
        Ok(total.into())
    })
});

/// Same recursion, but awaiting the children instead of returning a
/// composite over their futures.
static FIB_SYNC: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("fib-sync", |ctx, args| {
        let n = args[0].as_int().context("fib-sync expects an integer")?;
        if n < 2 {
            return Ok(Value::from(n));
        }
        let a = ctx.spawn(&FIB_SYNC, [Value::from(n - 1)])?;
        let b = ctx.spawn(&FIB_SYNC, [Value::from(n - 2)])?;
        let a = ctx.demand(a)?.as_int().context("fib-sync returns integers")?;
        let b = ctx.demand(b)?.as_int().context("fib-sync returns integers")?;
        Ok(Value::from(a + b))
    })
});

static TREE: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("tree", |ctx, args| {
        let n = args[0].as_int().context("tree expects an integer")?;
        if n == 0 {
            return Ok(Value::from(1));
        }
        let left = ctx.spawn(&TREE, [Value::from(n - 1)])?;
        let right = ctx.spawn(&TREE, [Value::from(n - 1)])?;
        let total = ctx.spawn(&TOTAL, [Value::seq([left.into(), right.into()])])?;
        Ok(total.into())
    })
});

static PING: LazyLock<Rule> =
    LazyLock::new(|| Rule::new("ping", |_ctx, _args| Ok(Value::from(1))));

/// Spawns and awaits a task whose output never reaches the return value.
static EFFECT: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("effect", |ctx, _args| {
        let ping = ctx.spawn(&PING, Vec::new())?;
        ctx.demand(ping)?;
        Ok(Value::from(0))
    })
});

static BOOM: LazyLock<Rule> =
    LazyLock::new(|| Rule::new("boom", |_ctx, _args| Err(anyhow::anyhow!("boom exploded"))));

static USE_BOOM: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new("use", |ctx, _args| {
        let boom = ctx.spawn(&BOOM, Vec::new())?;
        let value = ctx.demand(boom)?;
        Ok(Value::from(value.as_int().unwrap_or(0) + 1))
    })
});

#[derive(Default)]
struct Counts {
    created: Mutex<Vec<String>>,
    ran: Mutex<Vec<String>>,
}

impl Counts {
    fn created_for(&self, prefix: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|rule| rule.starts_with(prefix))
            .count()
    }

    fn ran_for(&self, prefix: &str) -> usize {
        self.ran
            .lock()
            .unwrap()
            .iter()
            .filter(|rule| rule.starts_with(prefix))
            .count()
    }

    fn ran_total(&self) -> usize {
        self.ran.lock().unwrap().len()
    }
}

struct Recorder(Arc<Counts>);

impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_task_created(&self, task: &mut TaskView<'_>) -> anyhow::Result<()> {
        self.0.created.lock().unwrap().push(task.rule().to_string());
        Ok(())
    }

    fn on_task_run_start(&self, task: &mut TaskView<'_>) -> anyhow::Result<()> {
        self.0.ran.lock().unwrap().push(task.rule().to_string());
        Ok(())
    }
}

fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("cache.db").to_str().unwrap().to_string()
}

#[test]
fn s1_fibonacci_is_memoised_within_a_session() {
    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();

    let root = session.task(&FIB, [Value::from(5)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(5));

    assert_eq!(counts.created_for("fib@"), 6);
    assert_eq!(counts.created_for("total@"), 4);
    assert_eq!(counts.ran_for("fib@"), 6);
    assert_eq!(session.task_count(), 10);
    session.close().unwrap();
}

#[test]
fn s2_results_persist_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let session = Session::builder()
        .cache(Cache::open(&path).unwrap())
        .open()
        .unwrap();
    let root = session.task(&FIB, [Value::from(5)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(5));
    session.close().unwrap();

    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .cache(Cache::open(&path).unwrap())
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();
    let root = session.task(&FIB, [Value::from(5)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(5));
    session.close().unwrap();

    // The fresh demand ran zero rule bodies.
    assert_eq!(counts.ran_total(), 0);
}

#[test]
fn s3_closing_before_running_leaves_the_cache_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let cache = Arc::new(Cache::open(&path).unwrap());

    let session = Session::builder().cache(cache.clone()).open().unwrap();
    let root = session.task(&FIB, [Value::from(5)]).unwrap();
    session.close().unwrap();
    assert_eq!(cache.result_count().unwrap(), 0);
    assert!(!cache.has_result(&root.fingerprint()).unwrap());

    // Re-demanding after the aborted session produces the full result.
    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .cache(cache.clone())
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();
    let root = session.task(&FIB, [Value::from(5)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(5));
    session.close().unwrap();

    assert_eq!(counts.ran_for("fib@"), 6);
    assert!(cache.result_count().unwrap() > 0);
    assert!(cache.has_result(&root.fingerprint()).unwrap());
}

#[test]
fn s4_concurrent_workers_execute_each_fingerprint_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let counts = Arc::new(Counts::default());
                let session = Session::builder()
                    .cache(Cache::open(&path).unwrap())
                    .plugin(Recorder(counts.clone()))
                    .open()
                    .unwrap();
                let root = session.task(&FIB, [Value::from(20)]).unwrap();
                assert_eq!(session.run(root).unwrap(), Value::from(6765));
                session.close().unwrap();
                counts
            })
        })
        .collect();

    let fib_runs: usize = workers
        .into_iter()
        .map(|worker| worker.join().unwrap().ran_for("fib@"))
        .sum();
    // fib(0) through fib(20), each exactly once across both workers.
    assert_eq!(fib_runs, 21);
}

#[test]
fn s5_errors_propagate_as_dependency_failures() {
    let session = Session::open().unwrap();
    let root = session.task(&USE_BOOM, Vec::new()).unwrap();
    let err = session.run(root).unwrap_err();

    match err {
        Error::DependencyFailed { dep, source, .. } => {
            assert!(dep.contains("boom"), "dep was {dep:?}");
            assert!(
                matches!(&*source, Error::RuleFailure { .. }),
                "source was {source:?}"
            );
        }
        other => panic!("expected a dependency failure, got {other:?}"),
    }
    session.close().unwrap();
}

#[test]
fn s6_dynamic_graphs_share_tasks_by_fingerprint() {
    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();

    let root = session.task(&TREE, [Value::from(5)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(32));

    // Six distinct tree tasks, not 2^5.
    assert_eq!(counts.created_for("tree@"), 6);
    session.close().unwrap();
}

#[test]
fn rerunning_in_the_same_session_runs_no_bodies() {
    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();

    let root = session.task(&FIB, [Value::from(8)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(21));
    let first = counts.ran_total();

    let root = session.task(&FIB, [Value::from(8)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(21));
    assert_eq!(counts.ran_total(), first);
    session.close().unwrap();
}

#[test]
fn side_tasks_are_recorded_in_creation_order() {
    let session = Session::open().unwrap();
    let root = session.task(&FIB, [Value::from(2)]).unwrap();
    session.run(root).unwrap();

    let side = session.side_tasks_of(root);
    assert_eq!(side.len(), 3); // fib(1), fib(0), total
    assert_eq!(session.all_tasks().len(), 4);
    session.close().unwrap();
}

#[test]
fn side_effect_only_tasks_are_published_as_deps() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::open(db_path(&dir)).unwrap());

    let session = Session::builder().cache(cache.clone()).open().unwrap();
    let root = session.task(&EFFECT, Vec::new()).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(0));

    let side = session.side_tasks_of(root);
    assert_eq!(side.len(), 1);
    session.close().unwrap();

    // The result of `effect` never embeds `ping`, yet the deps hint still
    // records the side-task relationship.
    let deps = cache.deps_of(&root.fingerprint()).unwrap();
    assert_eq!(deps, vec![side[0].fingerprint()]);
    assert_eq!(cache.deps_of(&side[0].fingerprint()).unwrap(), vec![]);
}

#[test]
fn nested_sessions_are_rejected() {
    let session = Session::open().unwrap();
    assert!(matches!(Session::open(), Err(Error::NestedSession)));
    session.close().unwrap();

    // The slot frees up after close.
    let session = Session::open().unwrap();
    session.close().unwrap();
}

#[test]
fn worker_pool_resolves_backflow_graphs() {
    let session = Session::builder().workers(4).open().unwrap();
    let root = session.task(&FIB, [Value::from(12)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(144));
    session.close().unwrap();
}

#[test]
fn worker_pool_parks_mid_body_demands() {
    let session = Session::builder().workers(4).open().unwrap();
    let root = session.task(&FIB_SYNC, [Value::from(9)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(34));
    session.close().unwrap();
}

#[test]
fn cooperative_demand_resolves_inline() {
    let session = Session::open().unwrap();
    let root = session.task(&FIB_SYNC, [Value::from(9)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(34));
    session.close().unwrap();
}

#[test]
fn self_demand_is_reported_as_a_deadlock() {
    static SELFISH: LazyLock<Rule> = LazyLock::new(|| {
        Rule::new("selfish", |ctx, args| {
            let me = ctx.spawn(&SELFISH, args.to_vec())?;
            Ok(ctx.demand(me)?)
        })
    });

    let session = Session::open().unwrap();
    let root = session.task(&SELFISH, Vec::new()).unwrap();
    let err = session.run(root).unwrap_err();
    match err {
        Error::DependencyFailed { source, .. } => {
            assert!(matches!(&*source, Error::Deadlock { .. }), "got {source:?}");
        }
        Error::Deadlock { .. } => {}
        other => panic!("expected a deadlock, got {other:?}"),
    }
    session.close().unwrap();
}

#[test]
fn plugin_errors_abort_the_session() {
    struct Failing;

    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_task_created(&self, _task: &mut TaskView<'_>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("refusing this task"))
        }
    }

    let session = Session::builder().plugin(Failing).open().unwrap();
    let err = session.task(&FIB, [Value::from(1)]).unwrap_err();
    match err {
        Error::PluginError { plugin, event, .. } => {
            assert_eq!(plugin, "failing");
            assert_eq!(event, memograph::Event::TaskCreated);
        }
        other => panic!("expected a plugin error, got {other:?}"),
    }
    session.close().unwrap();
}

#[test]
fn plugins_can_force_cached_tasks_to_rerun() {
    struct ForceAll;

    impl Plugin for ForceAll {
        fn name(&self) -> &str {
            "force-all"
        }

        fn on_task_created(&self, task: &mut TaskView<'_>) -> anyhow::Result<()> {
            task.force_run();
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let session = Session::builder()
        .cache(Cache::open(&path).unwrap())
        .open()
        .unwrap();
    let root = session.task(&FIB, [Value::from(3)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(2));
    session.close().unwrap();

    let counts = Arc::new(Counts::default());
    let session = Session::builder()
        .cache(Cache::open(&path).unwrap())
        .plugin(ForceAll)
        .plugin(Recorder(counts.clone()))
        .open()
        .unwrap();
    let root = session.task(&FIB, [Value::from(3)]).unwrap();
    assert_eq!(session.run(root).unwrap(), Value::from(2));
    session.close().unwrap();

    // Every body ran again for observability, despite the warm cache.
    assert_eq!(counts.ran_for("fib@"), 4);
    assert_eq!(counts.ran_for("total@"), 2);
}
