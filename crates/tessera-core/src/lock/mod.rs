//! Cooperative lock manager system agent.
//!
//! `sys_lock_manager` provides TTL-based leases over the standard adapter
//! contract: an ordinary agent hosted by an ordinary engine, which
//! makes it a full end-to-end exercise of the runtime invariants: leases
//! are event-sourced (`apply` folds the emitted lock events), expiry is
//! evaluated against the envelope's logical `ts`, and lease tokens are
//! derived deterministically from the command's `message_id`.
//!
//! Commands:
//!
//! - `cmd.lock.acquire {name, ttl_ms, holder}` grants when the entry is
//!   absent or expired, denies otherwise.
//! - `cmd.lock.release {name, token}` releases on token match, denies
//!   otherwise.
//! - `cmd.lock.refresh {name, token, ttl_ms}` extends an unexpired lease
//!   on token match; an expired lease answers `evt.lock.expired`.
//!
//! `tick` proactively emits `evt.lock.expired` for leases whose expiry
//! precedes the injected `now_ms`, in lock-name order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::adapter::{AdapterError, AgentAdapter, AgentState, HealthStatus};
use crate::determinism::derive_token;
use crate::envelope::{Actor, EventEnvelope, SecurityContext, Source, SCHEMA_VERSION};

/// Agent id the lock manager is bound to.
pub const LOCK_MANAGER_AGENT_ID: &str = "sys_lock_manager";

/// Lease TTL applied when an acquire names none.
pub const DEFAULT_TTL_MS: i64 = 5_000;

/// One granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Principal holding the lease.
    pub holder: String,
    /// Token that authorizes release and refresh.
    pub token: String,
    /// Logical time the lease was granted.
    pub acquired_at_ms: i64,
    /// Logical expiry time.
    pub expires_at_ms: i64,
}

/// The lock manager adapter.
#[derive(Debug, Default)]
pub struct LockManagerAdapter {
    leases: BTreeMap<String, Lease>,
    version: u64,
    last_processed: Option<String>,
    updated_at: i64,
}

impl LockManagerAdapter {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lease currently held on `name`, if any.
    #[must_use]
    pub fn lease(&self, name: &str) -> Option<&Lease> {
        self.leases.get(name)
    }

    fn decide_acquire(
        &self,
        envelope: &EventEnvelope,
        now: i64,
    ) -> Result<Vec<EventEnvelope>, AdapterError> {
        let name = required_str(envelope, "name")?;
        let holder = required_str(envelope, "holder")?;
        let ttl_ms = envelope
            .payload
            .get("ttl_ms")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_TTL_MS);
        if ttl_ms <= 0 {
            return Err(AdapterError::new("invalid_command", "ttl_ms must be positive"));
        }

        if let Some(lease) = self.leases.get(&name) {
            if now < lease.expires_at_ms {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("holder_current".to_string(), json!(lease.holder));
                payload.insert("requested_by".to_string(), json!(holder));
                payload.insert("reason".to_string(), json!("held"));
                return Ok(vec![lock_event(envelope, "denied", payload)]);
            }
        }

        let token = derive_token(&envelope.message_id);
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!(name));
        payload.insert("token".to_string(), json!(token));
        payload.insert("holder".to_string(), json!(holder));
        payload.insert("expires_at".to_string(), json!(now + ttl_ms));
        Ok(vec![lock_event(envelope, "acquired", payload)])
    }

    fn decide_release(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        let name = required_str(envelope, "name")?;
        let token = required_str(envelope, "token")?;

        match self.leases.get(&name) {
            Some(lease) if lease.token == token => {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("holder".to_string(), json!(lease.holder));
                Ok(vec![lock_event(envelope, "released", payload)])
            }
            Some(lease) => {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("holder_current".to_string(), json!(lease.holder));
                payload.insert("reason".to_string(), json!("token_mismatch"));
                Ok(vec![lock_event(envelope, "denied", payload)])
            }
            None => {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("reason".to_string(), json!("not_held"));
                Ok(vec![lock_event(envelope, "denied", payload)])
            }
        }
    }

    fn decide_refresh(
        &self,
        envelope: &EventEnvelope,
        now: i64,
    ) -> Result<Vec<EventEnvelope>, AdapterError> {
        let name = required_str(envelope, "name")?;
        let token = required_str(envelope, "token")?;
        let ttl_ms = envelope
            .payload
            .get("ttl_ms")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_TTL_MS);
        if ttl_ms <= 0 {
            return Err(AdapterError::new("invalid_command", "ttl_ms must be positive"));
        }

        match self.leases.get(&name) {
            Some(lease) if lease.token == token => {
                if lease.expires_at_ms <= now {
                    let mut payload = Map::new();
                    payload.insert("name".to_string(), json!(name));
                    Ok(vec![lock_event(envelope, "expired", payload)])
                } else {
                    let mut payload = Map::new();
                    payload.insert("name".to_string(), json!(name));
                    payload.insert("token".to_string(), json!(token));
                    payload.insert("holder".to_string(), json!(lease.holder));
                    payload.insert("expires_at".to_string(), json!(now + ttl_ms));
                    Ok(vec![lock_event(envelope, "refreshed", payload)])
                }
            }
            Some(lease) => {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("holder_current".to_string(), json!(lease.holder));
                payload.insert("reason".to_string(), json!("token_mismatch"));
                Ok(vec![lock_event(envelope, "denied", payload)])
            }
            None => {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                payload.insert("reason".to_string(), json!("not_held"));
                Ok(vec![lock_event(envelope, "denied", payload)])
            }
        }
    }
}

impl AgentAdapter for LockManagerAdapter {
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError> {
        if !envelope.is_command() {
            return Ok(Vec::new());
        }
        let now = envelope.ts.ok_or_else(|| {
            AdapterError::new("invalid_command", "envelope has no logical timestamp")
        })?;
        match envelope.verb() {
            Some("acquire") => self.decide_acquire(envelope, now),
            Some("release") => self.decide_release(envelope),
            Some("refresh") => self.decide_refresh(envelope, now),
            _ => {
                warn!(type_tag = %envelope.event_type, "ignoring unknown lock command");
                Ok(Vec::new())
            }
        }
    }

    fn apply(&mut self, envelope: &EventEnvelope) {
        let name = envelope
            .payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(name) = name {
            match envelope.event_type.as_str() {
                "evt.lock.acquired" => {
                    let holder = envelope
                        .payload
                        .get("holder")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let token = envelope
                        .payload
                        .get("token")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let expires_at_ms = envelope
                        .payload
                        .get("expires_at")
                        .and_then(Value::as_i64)
                        .unwrap_or_default();
                    self.leases.insert(
                        name,
                        Lease {
                            holder,
                            token,
                            acquired_at_ms: envelope.ts.unwrap_or_default(),
                            expires_at_ms,
                        },
                    );
                }
                "evt.lock.refreshed" => {
                    if let Some(lease) = self.leases.get_mut(&name) {
                        lease.expires_at_ms = envelope
                            .payload
                            .get("expires_at")
                            .and_then(Value::as_i64)
                            .unwrap_or(lease.expires_at_ms);
                    }
                }
                "evt.lock.released" | "evt.lock.expired" => {
                    self.leases.remove(&name);
                }
                _ => {}
            }
        }
        self.version += 1;
        self.last_processed = Some(envelope.message_id.clone());
        self.updated_at = envelope.ts.unwrap_or_default();
    }

    fn tick(&self, now_ms: i64) -> Vec<EventEnvelope> {
        // BTreeMap iteration gives a content-defined (name-sorted) order.
        self.leases
            .iter()
            .filter(|(_, lease)| lease.expires_at_ms < now_ms)
            .map(|(name, _)| {
                let mut payload = Map::new();
                payload.insert("name".to_string(), json!(name));
                EventEnvelope {
                    message_id: format!("{LOCK_MANAGER_AGENT_ID}-expired-{name}-{now_ms}"),
                    ts: Some(now_ms),
                    event_type: "evt.lock.expired".to_string(),
                    schema_version: SCHEMA_VERSION.to_string(),
                    tenant: String::new(),
                    workspace: String::new(),
                    security_context: SecurityContext::system(LOCK_MANAGER_AGENT_ID),
                    actor: Actor {
                        id: "system".to_string(),
                        role: LOCK_MANAGER_AGENT_ID.to_string(),
                    },
                    source: Source {
                        agent: LOCK_MANAGER_AGENT_ID.to_string(),
                        adapter: "runtime".to_string(),
                    },
                    payload,
                    idempotency_key: format!("lock-expired-{name}-{now_ms}"),
                    correlation_id: None,
                    causation_id: None,
                    trace_id: None,
                    span_id: None,
                    entity_id: None,
                    expected_version: None,
                    reply_to: None,
                    extensions: Map::new(),
                }
            })
            .collect()
    }

    fn state(&self) -> AgentState {
        let mut data = Map::new();
        data.insert(
            "locks".to_string(),
            serde_json::to_value(&self.leases).unwrap_or(Value::Null),
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

fn required_str(envelope: &EventEnvelope, field: &str) -> Result<String, AdapterError> {
    envelope
        .payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::new(
                "invalid_command",
                format!("'{}' requires payload field '{field}'", envelope.event_type),
            )
        })
}

fn lock_event(
    command: &EventEnvelope,
    verb: &str,
    payload: Map<String, Value>,
) -> EventEnvelope {
    let mut event = command.derived(
        format!("{}-{verb}", command.message_id),
        format!("evt.lock.{verb}"),
        payload,
    );
    event.source = Source {
        agent: LOCK_MANAGER_AGENT_ID.to_string(),
        adapter: "runtime".to_string(),
    };
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::command;

    fn lock_command(verb: &str, key: &str, ts: i64, payload: Map<String, Value>) -> EventEnvelope {
        let mut env = command("t1", "w1", "lock", verb, key, payload);
        env.ts = Some(ts);
        env
    }

    fn acquire(name: &str, holder: &str, ttl: i64, key: &str, ts: i64) -> EventEnvelope {
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!(name));
        payload.insert("holder".to_string(), json!(holder));
        payload.insert("ttl_ms".to_string(), json!(ttl));
        lock_command("acquire", key, ts, payload)
    }

    fn apply_all(adapter: &mut LockManagerAdapter, events: &[EventEnvelope]) {
        for event in events {
            adapter.apply(event);
        }
    }

    #[test]
    fn acquire_grants_on_free_lock() {
        let adapter = LockManagerAdapter::new();
        let events = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "evt.lock.acquired");
        assert_eq!(events[0].payload.get("expires_at"), Some(&json!(6_000)));
        assert_eq!(events[0].idempotency_key, "k1");
    }

    #[test]
    fn token_is_deterministic_per_message() {
        let adapter = LockManagerAdapter::new();
        let first = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        let second = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        assert_eq!(
            first[0].payload.get("token"),
            second[0].payload.get("token")
        );
    }

    #[test]
    fn acquire_denies_while_held() {
        let mut adapter = LockManagerAdapter::new();
        let granted = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        apply_all(&mut adapter, &granted);

        let denied = adapter.decide(&acquire("L", "bob", 5_000, "k2", 3_000)).unwrap();
        assert_eq!(denied[0].event_type, "evt.lock.denied");
        assert_eq!(denied[0].payload.get("holder_current"), Some(&json!("alice")));
    }

    #[test]
    fn acquire_succeeds_after_expiry() {
        let mut adapter = LockManagerAdapter::new();
        let granted = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        apply_all(&mut adapter, &granted);

        let regained = adapter.decide(&acquire("L", "bob", 5_000, "k2", 6_000)).unwrap();
        assert_eq!(regained[0].event_type, "evt.lock.acquired");
        assert_eq!(regained[0].payload.get("holder"), Some(&json!("bob")));
    }

    #[test]
    fn release_verifies_token() {
        let mut adapter = LockManagerAdapter::new();
        let granted = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        let token = granted[0].payload.get("token").cloned().unwrap();
        apply_all(&mut adapter, &granted);

        let mut bad = Map::new();
        bad.insert("name".to_string(), json!("L"));
        bad.insert("token".to_string(), json!("wrong"));
        let denied = adapter.decide(&lock_command("release", "k2", 2_000, bad)).unwrap();
        assert_eq!(denied[0].event_type, "evt.lock.denied");

        let mut good = Map::new();
        good.insert("name".to_string(), json!("L"));
        good.insert("token".to_string(), token);
        let released = adapter.decide(&lock_command("release", "k3", 2_500, good)).unwrap();
        assert_eq!(released[0].event_type, "evt.lock.released");
        apply_all(&mut adapter, &released);
        assert!(adapter.lease("L").is_none());
    }

    #[test]
    fn refresh_extends_unexpired_lease() {
        let mut adapter = LockManagerAdapter::new();
        let granted = adapter.decide(&acquire("L", "alice", 5_000, "k1", 1_000)).unwrap();
        let token = granted[0].payload.get("token").cloned().unwrap();
        apply_all(&mut adapter, &granted);

        let mut payload = Map::new();
        payload.insert("name".to_string(), json!("L"));
        payload.insert("token".to_string(), token.clone());
        payload.insert("ttl_ms".to_string(), json!(10_000));
        let refreshed = adapter.decide(&lock_command("refresh", "k2", 4_000, payload)).unwrap();
        assert_eq!(refreshed[0].event_type, "evt.lock.refreshed");
        assert_eq!(refreshed[0].payload.get("expires_at"), Some(&json!(14_000)));
        apply_all(&mut adapter, &refreshed);
        assert_eq!(adapter.lease("L").unwrap().expires_at_ms, 14_000);

        let mut payload = Map::new();
        payload.insert("name".to_string(), json!("L"));
        payload.insert("token".to_string(), token);
        payload.insert("ttl_ms".to_string(), json!(1_000));
        let expired = adapter.decide(&lock_command("refresh", "k3", 20_000, payload)).unwrap();
        assert_eq!(expired[0].event_type, "evt.lock.expired");
    }

    #[test]
    fn tick_emits_expired_leases_in_name_order() {
        let mut adapter = LockManagerAdapter::new();
        for (name, key) in [("b-lock", "k1"), ("a-lock", "k2")] {
            let mut payload = Map::new();
            payload.insert("name".to_string(), json!(name));
            payload.insert("holder".to_string(), json!("alice"));
            payload.insert("ttl_ms".to_string(), json!(1_000));
            let granted = adapter
                .decide(&lock_command("acquire", key, 1_000, payload))
                .unwrap();
            apply_all(&mut adapter, &granted);
        }

        let expired = adapter.tick(10_000);
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].payload.get("name"), Some(&json!("a-lock")));
        assert_eq!(expired[1].payload.get("name"), Some(&json!("b-lock")));
        assert_eq!(expired[0].idempotency_key, "lock-expired-a-lock-10000");

        apply_all(&mut adapter, &expired);
        assert!(adapter.lease("a-lock").is_none());
        assert!(adapter.lease("b-lock").is_none());
    }

    #[test]
    fn missing_fields_are_adapter_errors() {
        let adapter = LockManagerAdapter::new();
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!("L"));
        let err = adapter
            .decide(&lock_command("acquire", "k1", 1_000, payload))
            .unwrap_err();
        assert_eq!(err.code, "invalid_command");
    }
}
