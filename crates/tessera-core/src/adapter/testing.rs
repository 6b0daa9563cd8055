//! Deterministic adapters and envelope fixtures for tests.
//!
//! These are real adapter implementations kept small enough to reason about
//! in assertions: a key-value store with entity versioning, a relay that
//! forwards work to another agent, and an adapter that always fails.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{AdapterError, AgentAdapter, AgentState, HealthStatus};
use crate::envelope::{Actor, EventEnvelope, SecurityContext, Source, SCHEMA_VERSION};

/// Builds a command envelope bound for `agent` with sensible test defaults.
///
/// `ts` is left unset so the engine's clock injection is exercised.
#[must_use]
pub fn command(
    tenant: &str,
    workspace: &str,
    agent: &str,
    verb: &str,
    idempotency_key: &str,
    payload: Map<String, Value>,
) -> EventEnvelope {
    EventEnvelope {
        message_id: format!("msg-{idempotency_key}"),
        ts: None,
        event_type: format!("cmd.{agent}.{verb}"),
        schema_version: SCHEMA_VERSION.to_string(),
        tenant: tenant.to_string(),
        workspace: workspace.to_string(),
        security_context: SecurityContext {
            principal_id: "tester".to_string(),
            principal_type: crate::envelope::PrincipalType::User,
        },
        actor: Actor {
            id: "tester".to_string(),
            role: "test".to_string(),
        },
        source: Source {
            agent: "test-harness".to_string(),
            adapter: "testing".to_string(),
        },
        payload,
        idempotency_key: idempotency_key.to_string(),
        correlation_id: None,
        causation_id: None,
        trace_id: Some(format!("trace-{idempotency_key}")),
        span_id: None,
        entity_id: None,
        expected_version: None,
        reply_to: None,
        extensions: Map::new(),
    }
}

/// Key-value adapter with entity-versioned writes.
///
/// Accepts `cmd.<agent>.put {value}` (entity named by the envelope
/// `entity_id`) and emits `evt.<agent>.updated {entity_id, entity_version,
/// value}`. `cmd.<agent>.noop` decides to nothing.
#[derive(Debug)]
pub struct KeyValueAdapter {
    agent: String,
    entries: BTreeMap<String, Value>,
    entity_versions: BTreeMap<String, u64>,
    version: u64,
    last_processed: Option<String>,
    updated_at: i64,
}

impl KeyValueAdapter {
    /// Creates an empty key-value adapter for `agent`.
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            entries: BTreeMap::new(),
            entity_versions: BTreeMap::new(),
            version: 0,
            last_processed: None,
            updated_at: 0,
        }
    }

    /// Current value of an entity, if present.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<&Value> {
        self.entries.get(entity_id)
    }

    fn updated_type(&self) -> String {
        format!("evt.{}.updated", self.agent)
    }
}

impl AgentAdapter for KeyValueAdapter {
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        match envelope.verb() {
            Some("put") => {
                let entity_id = envelope.entity_id.clone().ok_or_else(|| {
                    AdapterError::new("invalid_command", "put requires an entity_id")
                })?;
                let value = envelope
                    .payload
                    .get("value")
                    .cloned()
                    .unwrap_or(Value::Null);
                let next_version = self.entity_versions.get(&entity_id).copied().unwrap_or(0) + 1;
                let mut payload = Map::new();
                payload.insert("entity_id".to_string(), json!(entity_id));
                payload.insert("entity_version".to_string(), json!(next_version));
                payload.insert("value".to_string(), value);
                let mut output = envelope.derived(
                    format!("{}-updated", envelope.message_id),
                    self.updated_type(),
                    payload,
                );
                output.entity_id = Some(entity_id);
                Ok(vec![output])
            }
            Some("noop") => Ok(Vec::new()),
            _ => Err(AdapterError::new(
                "unsupported_command",
                format!("no handler for '{}'", envelope.event_type),
            )),
        }
    }

    fn apply(&mut self, envelope: &EventEnvelope) {
        if envelope.event_type != self.updated_type() {
            return;
        }
        if let Some((entity_id, entity_version)) = envelope.entity_bump() {
            let value = envelope
                .payload
                .get("value")
                .cloned()
                .unwrap_or(Value::Null);
            self.entries.insert(entity_id.clone(), value);
            self.entity_versions.insert(entity_id, entity_version);
        }
        self.version += 1;
        self.last_processed = Some(envelope.message_id.clone());
        self.updated_at = envelope.ts.unwrap_or(0);
    }

    fn tick(&self, _now_ms: i64) -> Vec<EventEnvelope> {
        Vec::new()
    }

    fn state(&self) -> AgentState {
        let mut data = Map::new();
        data.insert(
            "entries".to_string(),
            serde_json::to_value(&self.entries).unwrap_or(Value::Null),
        );
        data.insert(
            "entity_versions".to_string(),
            serde_json::to_value(&self.entity_versions).unwrap_or(Value::Null),
        );
        AgentState {
            version: self.version,
            data,
            last_processed_event_id: self.last_processed.clone(),
            updated_at: self.updated_at,
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Ready
    }
}

/// Relay adapter that acknowledges ingestion and forwards a `put` to another
/// agent.
///
/// The forwarded command gets its own idempotency key (`<key>-fwd`) so the
/// downstream engine deduplicates it independently.
#[derive(Debug)]
pub struct RelayAdapter {
    agent: String,
    target: String,
    version: u64,
    last_processed: Option<String>,
    updated_at: i64,
}

impl RelayAdapter {
    /// Creates a relay from `agent` to `target`.
    #[must_use]
    pub fn new(agent: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            target: target.into(),
            version: 0,
            last_processed: None,
            updated_at: 0,
        }
    }
}

impl AgentAdapter for RelayAdapter {
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        if envelope.verb() != Some("ingest") {
            return Err(AdapterError::new(
                "unsupported_command",
                format!("no handler for '{}'", envelope.event_type),
            ));
        }
        let mut ingested_payload = Map::new();
        ingested_payload.insert("forwarded_to".to_string(), json!(self.target));
        let ingested = envelope.derived(
            format!("{}-ingested", envelope.message_id),
            format!("evt.{}.ingested", self.agent),
            ingested_payload,
        );

        let mut forward = envelope.derived(
            format!("{}-fwd", envelope.message_id),
            format!("cmd.{}.put", self.target),
            envelope.payload.clone(),
        );
        forward.idempotency_key = format!("{}-fwd", envelope.idempotency_key);
        forward.entity_id = envelope.entity_id.clone();

        Ok(vec![ingested, forward])
    }

    fn apply(&mut self, envelope: &EventEnvelope) {
        self.version += 1;
        self.last_processed = Some(envelope.message_id.clone());
        self.updated_at = envelope.ts.unwrap_or(0);
    }

    fn tick(&self, _now_ms: i64) -> Vec<EventEnvelope> {
        Vec::new()
    }

    fn state(&self) -> AgentState {
        AgentState {
            version: self.version,
            data: Map::new(),
            last_processed_event_id: self.last_processed.clone(),
            updated_at: self.updated_at,
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Ready
    }
}

/// Adapter whose decision logic always fails.
#[derive(Debug, Default)]
pub struct FailingAdapter {
    version: u64,
}

impl FailingAdapter {
    /// Creates a failing adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentAdapter for FailingAdapter {
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        Err(AdapterError::new(
            "always_fails",
            format!("refusing '{}'", envelope.event_type),
        ))
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
