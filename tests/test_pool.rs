//! End-to-end behaviour of pools created through the registry

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use workpool::pool::handler::Argument;
use workpool::{
    Codec, CompletionState, ContextState, EngineConfig, Invocation, ParallelError, ParamBinding,
    Payload, PoolEvent, PoolRegistry, PoolSummary, TaskResult, UnitState, WorkerError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Run {
    results: Vec<TaskResult>,
    errors: Vec<WorkerError>,
    summary: PoolSummary,
}

/// Collect events up to and including the terminal one
async fn run_to_end(events: &mut UnboundedReceiver<PoolEvent>) -> Run {
    let mut results = Vec::new();
    let mut errors = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for pool events")
            .expect("event channel closed");
        match event {
            PoolEvent::Result(result) => results.push(result),
            PoolEvent::Error(error) => errors.push(error),
            PoolEvent::End(summary) => {
                results.sort_by_key(|r| r.seq);
                return Run {
                    results,
                    errors,
                    summary,
                };
            }
        }
    }
}

/// Nothing but non-terminal events may follow
async fn assert_quiet(events: &mut UnboundedReceiver<PoolEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!event.is_end(), "terminal event raised twice");
    }
}

async fn double(call: Invocation) -> anyhow::Result<Value> {
    let n = call
        .data()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("expected an integer payload"))?;
    Ok(json!(n * 2))
}

async fn unit_of(call: Invocation) -> anyhow::Result<Value> {
    let ctx = call
        .context()
        .ok_or_else(|| anyhow::anyhow!("no context bound"))?;
    Ok(json!(ctx.unit()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_payload_answered_then_one_end() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(registry.pool_config("doubler", double).worker_count(3))
        .unwrap();
    let mut events = pool.subscribe();

    for i in 0..20 {
        assert_eq!(pool.send(json!(i)).unwrap(), i as u64);
    }
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    assert_eq!(run.results.len(), 20);
    for (i, result) in run.results.iter().enumerate() {
        assert_eq!(result.seq, i as u64);
        assert_eq!(result.value(), Some(&json!(i * 2)));
    }
    assert!(run.errors.is_empty());
    assert_eq!(run.summary.sent, 20);
    assert_eq!(run.summary.completed, 20);
    assert_eq!(run.summary.failed, 0);
    assert_quiet(&mut events).await;

    assert_eq!(pool.stats().state, CompletionState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_payloads_end_immediately() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(registry.pool_config("empty", double).worker_count(2))
        .unwrap();
    let mut events = pool.subscribe();

    pool.end_of_input();
    pool.end_of_input();

    match events.try_recv() {
        Ok(PoolEvent::End(summary)) => {
            assert_eq!(summary.sent, 0);
            assert_eq!(summary.completed, 0);
        }
        other => panic!("expected immediate end, got {:?}", other),
    }
    assert_eq!(pool.await_end().await.unwrap().sent, 0);
    assert_quiet(&mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_robin_placement() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(registry.pool_config("placement", unit_of).worker_count(3))
        .unwrap();
    let mut events = pool.subscribe();

    for i in 0..9 {
        pool.send(json!(i)).unwrap();
    }
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    for result in &run.results {
        let expected = (result.seq % 3) as usize;
        assert_eq!(result.unit, Some(expected));
        assert_eq!(result.value(), Some(&json!(expected)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_does_not_stop_later_payloads() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(registry.pool_config("strict", double).worker_count(1))
        .unwrap();
    let mut events = pool.subscribe();

    pool.send(json!(1)).unwrap();
    pool.send(json!("not a number")).unwrap();
    pool.send(json!(3)).unwrap();
    pool.send(json!(4)).unwrap();
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    assert_eq!(run.results.len(), 4);
    match run.results[1].error() {
        Some(WorkerError::Runtime { message, .. }) => {
            assert!(message.contains("expected an integer payload"))
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
    assert_eq!(run.results[1].error().map(WorkerError::kind), Some("WorkerRuntimeError"));
    assert_eq!(run.results[2].value(), Some(&json!(6)));
    assert_eq!(run.results[3].value(), Some(&json!(8)));
    assert_eq!(run.summary.failed, 1);
    assert_eq!(run.summary.succeeded(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_panic_is_contained() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("fragile", |call: Invocation| async move {
                    if call.data() == Some(&json!("explode")) {
                        panic!("corrupt record");
                    }
                    Ok::<_, anyhow::Error>(json!("ok"))
                })
                .worker_count(1),
        )
        .unwrap();
    let mut events = pool.subscribe();

    pool.send(json!("explode")).unwrap();
    pool.send(json!("fine")).unwrap();
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    assert!(matches!(
        run.results[0].error(),
        Some(WorkerError::Runtime { message, .. }) if message.contains("corrupt record")
    ));
    assert_eq!(run.results[1].value(), Some(&json!("ok")));
    assert_eq!(pool.stats().units, vec![UnitState::Ready]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_units_failing_bootstrap_rejects_dispatch() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("broken", double)
                .worker_count(2)
                .context_initializer(|| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<ContextState, _>(anyhow::anyhow!("schema file missing"))
                }),
        )
        .unwrap();
    let mut events = pool.subscribe();

    let err = pool.await_start().await.unwrap_err();
    assert!(matches!(err, ParallelError::NoWorkersAvailable { .. }));

    let err = pool.send(json!(1)).unwrap_err();
    assert!(matches!(err, ParallelError::NoWorkersAvailable { .. }));
    assert_eq!(pool.stats().sent, 0);
    assert_eq!(pool.stats().usable_units(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut bootstrap_errors = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::Error(WorkerError::Bootstrap { message, .. }) => {
                assert!(message.contains("schema file missing"));
                bootstrap_errors += 1;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(bootstrap_errors, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_payload_sent_while_bootstrap_fails() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("slow-broken", double)
                .worker_count(1)
                .context_initializer(|| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<ContextState, _>(anyhow::anyhow!("connection refused"))
                }),
        )
        .unwrap();
    let mut events = pool.subscribe();

    pool.send(json!(1)).unwrap();
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    assert_eq!(run.results.len(), 1);
    assert_eq!(
        run.results[0].error().map(WorkerError::kind),
        Some("WorkerBootstrapFailure")
    );
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.summary.failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_state_and_custom_bindings() {
    struct Lookup(BTreeMap<i64, &'static str>);

    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("lookup", |call: Invocation| async move {
                    let (ctx, id) = match (call.arg(0), call.arg(1)) {
                        (Some(Argument::Context(ctx)), Some(Argument::Data(data))) => {
                            (ctx.clone(), data.as_i64().unwrap_or_default())
                        }
                        _ => anyhow::bail!("unexpected argument layout"),
                    };
                    let table = ctx
                        .state::<Lookup>()
                        .ok_or_else(|| anyhow::anyhow!("missing lookup table"))?;
                    Ok::<_, anyhow::Error>(json!(table.0.get(&id).copied()))
                })
                .worker_count(2)
                .bindings(vec![ParamBinding::context(0), ParamBinding::data(1)])
                .context_initializer(|| async move {
                    let table = BTreeMap::from([(1, "alpha"), (2, "beta")]);
                    Ok::<ContextState, anyhow::Error>(Arc::new(Lookup(table)))
                }),
        )
        .unwrap();
    let mut events = pool.subscribe();
    assert_eq!(pool.await_start().await.unwrap(), 2);

    for id in [1, 2, 3] {
        pool.send(json!(id)).unwrap();
    }
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    let values: Vec<_> = run.results.iter().map(|r| r.value().cloned()).collect();
    assert_eq!(
        values,
        vec![Some(json!("alpha")), Some(json!("beta")), Some(Value::Null)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_batch_lands_on_one_unit_in_order() {
    init_tracing();
    let seen: Arc<Mutex<Vec<(usize, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("batched", move |call: Invocation| {
                    let recorder = recorder.clone();
                    async move {
                        let unit = call.context().map(|ctx| ctx.unit()).unwrap_or_default();
                        let n = call.data().and_then(Value::as_i64).unwrap_or_default();
                        recorder.lock().push((unit, n));
                        Ok::<_, anyhow::Error>(json!(n))
                    }
                })
                .worker_count(2)
                .batch_size(4)
                .flush_interval(Duration::from_secs(60)),
        )
        .unwrap();
    let mut events = pool.subscribe();

    for i in 0..8 {
        pool.send(json!(i)).unwrap();
    }
    assert_eq!(pool.stats().buffered, 0);
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    assert_eq!(run.results.len(), 8);

    let seen = seen.lock().clone();
    let on_unit = |unit: usize| -> Vec<i64> {
        seen.iter()
            .filter(|(u, _)| *u == unit)
            .map(|(_, n)| *n)
            .collect()
    };
    assert_eq!(on_unit(0), vec![0, 1, 2, 3]);
    assert_eq!(on_unit(1), vec![4, 5, 6, 7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_batch_flushes_on_interval() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("interval", double)
                .worker_count(2)
                .batch_size(10)
                .flush_interval(Duration::from_millis(20)),
        )
        .unwrap();
    let mut events = pool.subscribe();

    for i in 0..3 {
        pool.send(json!(i)).unwrap();
    }
    assert_eq!(pool.stats().buffered, 3);

    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("buffered payloads were never flushed")
            .unwrap();
        assert!(matches!(event, PoolEvent::Result(_)));
    }

    let stats = pool.stats();
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.state, CompletionState::Sending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_namespace_leaves_original_untouched() {
    init_tracing();
    let registry = PoolRegistry::new();
    let original = registry
        .create_pool(registry.pool_config("customers", double).worker_count(1))
        .unwrap();
    original.send(json!(1)).unwrap();
    original.send(json!(2)).unwrap();

    let err = registry
        .create_pool(registry.pool_config("customers", unit_of).worker_count(2))
        .unwrap_err();
    assert!(matches!(err, ParallelError::DuplicateNamespace { .. }));

    let kept = registry.get_pool("customers").unwrap();
    assert_eq!(kept.id(), original.id());
    assert_eq!(kept.worker_count(), 1);
    assert_eq!(kept.stats().sent, 2);

    kept.end_of_input();
    let summary = tokio::time::timeout(Duration::from_secs(5), original.await_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bincode_pool_with_pre_encoded_payloads() {
    init_tracing();
    let registry =
        PoolRegistry::with_config(EngineConfig::builder().codec(Codec::Bincode).build().unwrap())
            .unwrap();
    let pool = registry
        .create_pool(
            registry
                .pool_config("binary", |call: Invocation| async move {
                    let mut record = call.into_data().unwrap_or(Value::Null);
                    record["seen"] = json!(true);
                    Ok::<_, anyhow::Error>(record)
                })
                .worker_count(2),
        )
        .unwrap();
    assert_eq!(pool.settings().codec, Codec::Bincode);
    let mut events = pool.subscribe();

    let record = json!({"id": 7, "score": 0.25, "tags": ["a", null], "meta": {"big": u64::MAX}});
    pool.send(record.clone()).unwrap();
    pool.send(Payload::Encoded(Codec::Bincode.encode(&record).unwrap()))
        .unwrap();
    pool.send(Payload::Encoded(b"not bincode".to_vec())).unwrap();
    pool.end_of_input();

    let run = run_to_end(&mut events).await;
    let mut expected = record;
    expected["seen"] = json!(true);
    assert_eq!(run.results[0].value(), Some(&expected));
    assert_eq!(run.results[1].value(), Some(&expected));
    assert_eq!(run.results[2].error().map(WorkerError::kind), Some("DecodeError"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_after_end_is_rejected() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(registry.pool_config("closed", double).worker_count(1))
        .unwrap();

    pool.send(json!(1)).unwrap();
    pool.end_of_input();
    let err = pool.send(json!(2)).unwrap_err();
    assert!(matches!(err, ParallelError::InputEnded { .. }));

    let summary = tokio::time::timeout(Duration::from_secs(5), pool.await_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.sent, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completed_never_exceeds_sent() {
    init_tracing();
    let registry = PoolRegistry::new();
    let pool = registry
        .create_pool(
            registry
                .pool_config("counters", |call: Invocation| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    double(call).await
                })
                .worker_count(4),
        )
        .unwrap();

    for i in 0..200 {
        pool.send(json!(i)).unwrap();
        let stats = pool.stats();
        assert!(stats.completed <= stats.sent);
    }
    pool.end_of_input();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = pool.stats();
            assert!(stats.completed <= stats.sent);
            if stats.state == CompletionState::Completed {
                assert_eq!(stats.completed, 200);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pool never drained");
}
