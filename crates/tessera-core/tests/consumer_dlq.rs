//! Consumer-level tests: poison-pill dead-lettering, multi-agent command
//! chains, and drain-on-shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tessera_core::adapter::testing::{command, KeyValueAdapter, RelayAdapter};
use tessera_core::consumer::{ConsumerConfig, MemoryConsumer};
use tessera_core::store::SqliteEventStore;
use tessera_core::transport::memory::{InProcessRouter, MemoryBus, MemoryWorkQueue};
use tessera_core::transport::CommandRouter;
use tessera_core::{EventBus, EventStore, RuntimeConfig, RuntimeEngine};

use common::{put, PoisonBus, TENANT, WORKSPACE};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn poison_pill_moves_to_dlq_and_stream_continues() {
    let store = Arc::new(SqliteEventStore::in_memory().expect("open store"));
    let bus = Arc::new(MemoryBus::new());
    let poisoned = Arc::new(PoisonBus::rejecting(Arc::clone(&bus), "poison"));
    let router = Arc::new(InProcessRouter::new());

    let mut config = RuntimeConfig::new(TENANT, WORKSPACE, "kv").deterministic();
    config.backoff_schedule_ms = vec![1, 1, 1, 1, 1];
    let engine = Arc::new(
        RuntimeEngine::new(
            config,
            Box::new(KeyValueAdapter::new("kv")),
            Arc::clone(&store) as Arc<dyn EventStore>,
            poisoned,
            Arc::clone(&router) as Arc<dyn CommandRouter>,
        )
        .expect("engine"),
    );

    let queue = Arc::new(MemoryWorkQueue::new(&[1, 1, 1, 1, 1]));
    queue.push("cmd.t1.w1.kv.put", put("poison-1", "P", "bad", None));
    queue.push("cmd.t1.w1.kv.put", put("good-1", "G", "good", None));

    let metrics = Arc::new(tessera_core::telemetry::CounterMetrics::new());
    let handle = MemoryConsumer::new(
        Arc::clone(&queue),
        Arc::clone(&engine),
        ConsumerConfig { max_deliver: 5 },
    )
    .with_metrics(Arc::clone(&metrics) as Arc<dyn tessera_core::telemetry::MetricsSink>)
    .spawn();

    wait_until(|| {
        queue.dead_letters().len() == 1
            && bus
                .envelopes()
                .iter()
                .any(|e| e.idempotency_key == "good-1")
    })
    .await;
    handle.shutdown().await;

    // The original message was acked into the DLQ under failed.<subject>.
    let dead = queue.dead_letters();
    assert_eq!(dead[0].0, "failed.cmd.t1.w1.kv.put");
    assert_eq!(dead[0].1.idempotency_key, "poison-1");
    assert!(queue.is_idle());
    assert_eq!(
        metrics.get(tessera_core::telemetry::Metric::DeadLetters),
        1
    );

    // Subsequent messages were processed; the engine is still live.
    let outcome = engine
        .process(put("after-dlq", "A", "v", None))
        .await
        .expect("engine continues");
    assert!(matches!(
        outcome,
        tessera_core::ProcessOutcome::Committed { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn command_chain_crosses_agents_through_the_router() {
    let bus = Arc::new(MemoryBus::new());
    let router = Arc::new(InProcessRouter::new());

    // Each engine owns its store; they share the bus and the router.
    let relay_store = Arc::new(SqliteEventStore::in_memory().expect("relay store"));
    let relay_engine = Arc::new(
        RuntimeEngine::new(
            RuntimeConfig::new(TENANT, WORKSPACE, "relay").deterministic(),
            Box::new(RelayAdapter::new("relay", "kv")),
            Arc::clone(&relay_store) as Arc<dyn EventStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&router) as Arc<dyn CommandRouter>,
        )
        .expect("relay engine"),
    );

    let kv_store = Arc::new(SqliteEventStore::in_memory().expect("kv store"));
    let kv_engine = Arc::new(
        RuntimeEngine::new(
            RuntimeConfig::new(TENANT, WORKSPACE, "kv").deterministic(),
            Box::new(KeyValueAdapter::new("kv")),
            Arc::clone(&kv_store) as Arc<dyn EventStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&router) as Arc<dyn CommandRouter>,
        )
        .expect("kv engine"),
    );

    let relay_queue = Arc::new(MemoryWorkQueue::new(&[1]));
    let kv_queue = Arc::new(MemoryWorkQueue::new(&[1]));
    router.register("relay", Arc::clone(&relay_queue));
    router.register("kv", Arc::clone(&kv_queue));

    let relay_consumer = MemoryConsumer::new(
        Arc::clone(&relay_queue),
        Arc::clone(&relay_engine),
        ConsumerConfig::default(),
    )
    .spawn();
    let kv_consumer = MemoryConsumer::new(
        Arc::clone(&kv_queue),
        Arc::clone(&kv_engine),
        ConsumerConfig::default(),
    )
    .spawn();

    // Seed the saga with one ingest command.
    let mut payload = Map::new();
    payload.insert("value".to_string(), json!("relayed"));
    let mut ingest = command(TENANT, WORKSPACE, "relay", "ingest", "saga-1", payload);
    ingest.entity_id = Some("e1".to_string());
    router.route(&ingest).await.expect("seed routed");

    wait_until(|| {
        let published = bus.envelopes();
        published.iter().any(|e| e.event_type == "evt.relay.ingested")
            && published.iter().any(|e| e.event_type == "evt.kv.updated")
    })
    .await;

    relay_consumer.shutdown().await;
    kv_consumer.shutdown().await;

    // The chained write landed in the downstream agent's state.
    let state = kv_engine.agent_state().await;
    let entries = state.data.get("entries").expect("entries");
    assert_eq!(entries.get("e1"), Some(&json!("relayed")));

    // Lineage: the forwarded command caused the downstream event.
    let updated = bus
        .envelopes()
        .into_iter()
        .find(|e| e.event_type == "evt.kv.updated")
        .expect("updated event");
    assert_eq!(updated.causation_id.as_deref(), Some("msg-saga-1-fwd"));
    assert_eq!(updated.idempotency_key, "saga-1-fwd");
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_the_in_flight_message() {
    let store = Arc::new(SqliteEventStore::in_memory().expect("open store"));
    let bus = Arc::new(MemoryBus::new());
    let router = Arc::new(InProcessRouter::new());
    let engine = Arc::new(
        RuntimeEngine::new(
            RuntimeConfig::new(TENANT, WORKSPACE, "kv").deterministic(),
            Box::new(KeyValueAdapter::new("kv")),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&router) as Arc<dyn CommandRouter>,
        )
        .expect("engine"),
    );

    let queue = Arc::new(MemoryWorkQueue::new(&[1]));
    queue.push("cmd.t1.w1.kv.put", put("k1", "e1", "v", None));

    let handle = MemoryConsumer::new(
        Arc::clone(&queue),
        Arc::clone(&engine),
        ConsumerConfig::default(),
    )
    .spawn();

    wait_until(|| queue.is_idle()).await;
    handle.shutdown().await;

    assert_eq!(bus.envelopes().len(), 1);
    assert_eq!(engine.agent_state().await.version, 1);
}
