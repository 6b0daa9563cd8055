//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tessera_core::adapter::testing::{command, KeyValueAdapter};
use tessera_core::adapter::{AdapterError, AgentAdapter, AgentState, HealthStatus};
use tessera_core::envelope::EventEnvelope;
use tessera_core::store::SqliteEventStore;
use tessera_core::transport::memory::{InProcessRouter, MemoryBus};
use tessera_core::transport::{EventBus, TransportError};
use tessera_core::{EventStore, RuntimeConfig, RuntimeEngine};

pub const TENANT: &str = "t1";
pub const WORKSPACE: &str = "w1";

/// Engine over a fresh in-memory store with a recording bus.
pub struct Rig {
    pub engine: Arc<RuntimeEngine>,
    pub bus: Arc<MemoryBus>,
    pub store: Arc<SqliteEventStore>,
    pub router: Arc<InProcessRouter>,
}

pub fn rig_with(adapter: Box<dyn AgentAdapter>, agent_id: &str, deterministic: bool) -> Rig {
    let store = Arc::new(SqliteEventStore::in_memory().expect("open store"));
    rig_on_store(adapter, agent_id, deterministic, store)
}

pub fn rig_on_store(
    adapter: Box<dyn AgentAdapter>,
    agent_id: &str,
    deterministic: bool,
    store: Arc<SqliteEventStore>,
) -> Rig {
    let bus = Arc::new(MemoryBus::new());
    let router = Arc::new(InProcessRouter::new());
    let mut config = RuntimeConfig::new(TENANT, WORKSPACE, agent_id);
    if deterministic {
        config = config.deterministic();
    }
    let engine = RuntimeEngine::new(
        config,
        adapter,
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::clone(&router) as Arc<dyn tessera_core::CommandRouter>,
    )
    .expect("engine construction");
    Rig {
        engine: Arc::new(engine),
        bus,
        store,
        router,
    }
}

pub fn kv_rig() -> Rig {
    rig_with(Box::new(KeyValueAdapter::new("kv")), "kv", true)
}

/// A `put` command with entity assertions.
pub fn put(key: &str, entity: &str, value: &str, expected: Option<u64>) -> EventEnvelope {
    let mut payload = Map::new();
    payload.insert("value".to_string(), json!(value));
    let mut env = command(TENANT, WORKSPACE, "kv", "put", key, payload);
    env.entity_id = Some(entity.to_string());
    env.expected_version = expected;
    env
}

/// Bus decorator that fails the first `n` publishes.
pub struct FlakyBus {
    inner: Arc<MemoryBus>,
    failures_left: AtomicU32,
}

impl FlakyBus {
    pub fn failing(inner: Arc<MemoryBus>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Publish {
                subject: envelope.event_type.clone(),
                reason: "injected outage".to_string(),
            });
        }
        self.inner.publish(envelope).await
    }
}

/// Bus decorator that always fails publishes whose record key contains a
/// marker, simulating a downstream that never accepts one message.
pub struct PoisonBus {
    inner: Arc<MemoryBus>,
    marker: String,
}

impl PoisonBus {
    pub fn rejecting(inner: Arc<MemoryBus>, marker: &str) -> Self {
        Self {
            inner,
            marker: marker.to_string(),
        }
    }
}

#[async_trait]
impl EventBus for PoisonBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if envelope.idempotency_key.contains(&self.marker) {
            return Err(TransportError::Publish {
                subject: envelope.event_type.clone(),
                reason: "poisoned downstream".to_string(),
            });
        }
        self.inner.publish(envelope).await
    }
}

/// Adapter that tries to smuggle outputs into a foreign tenant.
pub struct SpoofingAdapter {
    version: u64,
}

impl SpoofingAdapter {
    pub fn new() -> Self {
        Self { version: 0 }
    }
}

impl AgentAdapter for SpoofingAdapter {
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        let mut payload = Map::new();
        payload.insert("smuggled".to_string(), Value::Bool(true));
        let mut output = envelope.derived(
            format!("{}-spoofed", envelope.message_id),
            "evt.kv.updated",
            payload,
        );
        output.tenant = "evil-tenant".to_string();
        output.workspace = "evil-workspace".to_string();
        output.security_context = tessera_core::SecurityContext {
            principal_id: "mallory".to_string(),
            principal_type: tessera_core::envelope::PrincipalType::Service,
        };
        Ok(vec![output])
    }

    fn apply(&mut self, _envelope: &EventEnvelope) {
        self.version += 1;
    }

    fn tick(&self, _now_ms: i64) -> Vec<EventEnvelope> {
        Vec::new()
    }

    fn state(&self) -> AgentState {
        AgentState {
            version: self.version,
            data: Map::new(),
            last_processed_event_id: None,
            updated_at: 0,
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Ready
    }
}

/// Canonical JSON of a batch, for byte-equality assertions.
pub fn canonical_batch(envelopes: &[EventEnvelope]) -> Vec<String> {
    envelopes
        .iter()
        .map(|e| tessera_core::determinism::to_canonical_json(e).expect("canonical"))
        .collect()
}
