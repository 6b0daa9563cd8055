//! The runtime engine processing loop.
//!
//! One engine instance hosts one adapter under one `(tenant, workspace)`
//! scope and drives it through the processing protocol:
//!
//! ```text
//! RECEIVED -> SCOPE_OK -> (DEDUP_HIT -> REPUBLISH -> ACKED)
//!                       | (DEDUP_MISS -> CONCURRENCY_OK -> DECIDED
//!                          -> COMMITTED -> APPLIED -> PUBLISHED -> ACKED)
//! ```
//!
//! Any step that fails before the acknowledgement leaves a redelivery to
//! recover through the dedup hit: outputs are committed to the store under
//! the command's idempotency key before they are published, so the engine
//! can always republish instead of re-deciding.
//!
//! A single mutex serializes `process`, `tick`, and `replay`, so at most
//! one message is in flight per engine. Running two engines for the same
//! `(tenant, workspace, agent)` is forbidden.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use crate::adapter::{AgentAdapter, AgentState, HealthStatus};
use crate::config::RuntimeConfig;
use crate::determinism::{self, CanonicalJsonError};
use crate::envelope::{collect_entity_bumps, EventEnvelope, Scope, SecurityContext};
use crate::store::{CommandRecord, EventStore, StoreError};
use crate::telemetry::{Metric, MetricsSink, NoopMetrics};
use crate::transport::{CommandRouter, EventBus, TransportError};

/// Fixed logical time used when the engine runs in deterministic mode.
pub const DETERMINISTIC_EPOCH_MS: i64 = 1_234_567_890_000;

/// Transient failures of the processing loop.
///
/// An `Err` from [`RuntimeEngine::process`] means the message must **not**
/// be acknowledged: the transport will redeliver and the idempotency ledger
/// guarantees the retry converges. Terminal dispositions (rejections,
/// conflicts, adapter failures) are [`ProcessOutcome`] variants instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Event store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transport publish/route failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Canonicalization failure while hashing or serializing state.
    #[error("canonicalization error: {0}")]
    Canonical(#[from] CanonicalJsonError),

    /// The per-message deadline elapsed before acknowledgement.
    #[error("processing deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded {
        /// The configured deadline.
        deadline_ms: u64,
    },

    /// The adapter failed registration validation.
    #[error("adapter rejected at registration: {reason}")]
    AdapterRejected {
        /// Why the adapter was rejected.
        reason: String,
    },
}

/// Why an envelope was rejected at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Tenant/workspace did not match the engine scope, or the security
    /// context is missing/invalid.
    ScopeViolation,
    /// The envelope violated the contract (missing required field, unknown
    /// type namespace).
    ContractViolation,
}

impl RejectionKind {
    const fn code(self) -> &'static str {
        match self {
            Self::ScopeViolation => "scope_violation",
            Self::ContractViolation => "contract_violation",
        }
    }
}

/// Terminal disposition of one processed envelope.
///
/// Every variant is acknowledgeable: the message reached a durable,
/// auditable end state.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The command was decided, committed, applied, and its outputs
    /// published.
    Committed {
        /// Outputs in adapter emission order.
        outputs: Vec<EventEnvelope>,
    },
    /// The command's idempotency key was already committed; the stored
    /// outputs were republished and the adapter was not invoked.
    Duplicate {
        /// The stored republished envelopes.
        outputs: Vec<EventEnvelope>,
    },
    /// The asserted entity version did not match; a conflict event was
    /// persisted and published.
    Conflict {
        /// The `evt.<agent>.conflict` envelope.
        event: EventEnvelope,
    },
    /// The envelope was rejected at ingress; a security-violation record
    /// was persisted and published.
    Rejected {
        /// The `evt.security.violation` envelope.
        violation: EventEnvelope,
        /// Which check failed.
        kind: RejectionKind,
    },
    /// The adapter's decision failed; an `evt.runtime.error` record was
    /// persisted and published.
    Failed {
        /// The `evt.runtime.error` envelope.
        error_event: EventEnvelope,
    },
}

impl ProcessOutcome {
    /// The envelopes published as a consequence of this disposition.
    #[must_use]
    pub fn outputs(&self) -> &[EventEnvelope] {
        match self {
            Self::Committed { outputs } | Self::Duplicate { outputs } => outputs,
            Self::Conflict { event } => std::slice::from_ref(event),
            Self::Rejected { violation, .. } => std::slice::from_ref(violation),
            Self::Failed { error_event } => std::slice::from_ref(error_event),
        }
    }

    /// Whether this was a dedup hit.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

struct EngineInner {
    adapter: Box<dyn AgentAdapter>,
    processed: HashSet<String>,
}

/// The runtime engine.
///
/// Binds the event store, the transport surfaces, and one adapter under the
/// invariants described at the module level.
pub struct RuntimeEngine {
    config: RuntimeConfig,
    scope: Scope,
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    router: Arc<dyn CommandRouter>,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<EngineInner>,
}

impl RuntimeEngine {
    /// Creates an engine, validating the adapter at registration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AdapterRejected`] when the adapter reports
    /// [`HealthStatus::Failed`] or its state cannot be canonicalized, and
    /// [`EngineError::Canonical`] when state hashing fails outright.
    pub fn new(
        config: RuntimeConfig,
        adapter: Box<dyn AgentAdapter>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        router: Arc<dyn CommandRouter>,
    ) -> Result<Self, EngineError> {
        if adapter.health() == HealthStatus::Failed {
            return Err(EngineError::AdapterRejected {
                reason: "adapter reports FAILED health".to_string(),
            });
        }
        determinism::state_hash(&adapter.state()).map_err(|e| EngineError::AdapterRejected {
            reason: format!("adapter state is not canonicalizable: {e}"),
        })?;

        let scope = config.scope();
        Ok(Self {
            config,
            scope,
            store,
            bus,
            router,
            metrics: Arc::new(NoopMetrics),
            inner: Mutex::new(EngineInner {
                adapter,
                processed: HashSet::new(),
            }),
        })
    }

    /// Replaces the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The engine's isolation scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The agent id this engine hosts.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    fn now_ms(&self) -> i64 {
        if self.config.deterministic {
            DETERMINISTIC_EPOCH_MS
        } else {
            chrono::Utc::now().timestamp_millis()
        }
    }

    /// Processes one inbound envelope to a terminal disposition.
    ///
    /// Invocations are serialized per engine instance; the call suspends
    /// only on store I/O, publish, and the internal lock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for transient failures; the caller must not
    /// acknowledge the delivery and should rely on redelivery.
    pub async fn process(&self, envelope: EventEnvelope) -> Result<ProcessOutcome, EngineError> {
        let span = tracing::info_span!(
            "process_event",
            agent = %self.config.agent_id,
            event_type = %envelope.event_type,
            message_id = %envelope.message_id,
        );
        let deadline = Duration::from_millis(self.config.process_deadline_ms);
        let work = self.process_serialized(envelope);
        match tokio::time::timeout(deadline, work.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DeadlineExceeded {
                deadline_ms: self.config.process_deadline_ms,
            }),
        }
    }

    async fn process_serialized(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<ProcessOutcome, EngineError> {
        let mut inner = self.inner.lock().await;
        let started = std::time::Instant::now();
        self.metrics.incr(Metric::EventsReceived, 1);

        // Ingress scope check: tenant/workspace and the stamped security
        // context are validated in the same step. Out-of-scope traffic
        // becomes an audit record under the engine's own scope; the foreign
        // payload is not stored.
        let scope_breach = if !self.scope.admits(&envelope) {
            Some(format!(
                "envelope scope {}/{} does not match engine scope {}",
                envelope.tenant, envelope.workspace, self.scope
            ))
        } else if !envelope.security_context.is_valid() {
            Some("security context names an empty principal".to_string())
        } else {
            None
        };
        if let Some(reason) = scope_breach {
            warn!(%reason, "security violation");
            return self
                .reject(&mut inner, &envelope, RejectionKind::ScopeViolation, reason)
                .await;
        }

        // Contract check: required fields, known namespace.
        if let Err(violation) = envelope.validate() {
            let reason = violation.to_string();
            warn!(%reason, "contract violation");
            return self
                .reject(&mut inner, &envelope, RejectionKind::ContractViolation, reason)
                .await;
        }

        // Logical time injection happens before the adapter ever sees the
        // envelope; adapters never read the wall clock.
        if envelope.ts.is_none() {
            envelope.ts = Some(self.now_ms());
        }

        // Idempotency lookup. A hit republishes the stored outputs and
        // skips the adapter entirely: this is the recovery path for
        // "crashed after store, before publish/ack".
        let key = envelope.idempotency_key.clone();
        if let Some(outputs) = self.store.lookup_outputs(&self.scope, &key)? {
            inner.processed.insert(key);
            self.observe_duration(started);
            return self.republish_duplicate(&envelope.idempotency_key, outputs).await;
        }

        // Optimistic concurrency check against the committed entity table.
        if let (Some(entity_id), Some(expected)) =
            (envelope.entity_id.clone(), envelope.expected_version)
        {
            let current = self
                .store
                .current_entity_version(&self.scope, &self.config.agent_id, &entity_id)?
                .unwrap_or(0);
            if current != expected {
                return self
                    .conflict(&mut inner, &envelope, &entity_id, expected, current)
                    .await;
            }
        }

        // Decide. Adapter failures are application errors: they are
        // committed as audit records and acknowledged, not retried.
        let decision = inner.adapter.decide(&envelope);
        let mut outputs = match decision {
            Ok(outputs) => outputs,
            Err(error) => {
                return self.adapter_failure(&mut inner, &envelope, &error).await;
            }
        };

        // Egress scope rewrite: adapters cannot spoof another tenant.
        self.rewrite_egress(&envelope, &mut outputs);
        let bumps = collect_entity_bumps(&outputs);

        // One commit boundary: input, outputs, and entity bumps land
        // atomically under the command's idempotency key.
        let record = CommandRecord {
            key: &key,
            input: Some(&envelope),
            outputs: &outputs,
            audits: &[],
            entity_bumps: &bumps,
        };
        match self.store.append(&self.scope, &self.config.agent_id, &record) {
            Ok(()) => {}
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                // Lost the cache but not the commit (restart without
                // replay, or a concurrent writer): fall back to the stored
                // outputs.
                if let Some(stored) = self.store.lookup_outputs(&self.scope, &key)? {
                    return self.republish_duplicate(&key, stored).await;
                }
                return Err(EngineError::Store(StoreError::DuplicateIdempotencyKey {
                    key: key.clone(),
                    scope: self.scope.to_string(),
                }));
            }
            Err(other) => return Err(other.into()),
        }

        // Apply the committed outputs to in-memory state.
        for output in &outputs {
            inner.adapter.apply(output);
        }

        // Publish side effects; a failure here leaves the commit in place
        // and redelivery republishes through the dedup hit.
        self.publish_all(&outputs).await?;

        inner.processed.insert(key);
        debug!(outputs = outputs.len(), "committed");
        self.observe_duration(started);
        Ok(ProcessOutcome::Committed { outputs })
    }

    /// Rebuilds adapter state from the store.
    ///
    /// Replays the committed output rows in append order, repopulates the
    /// idempotency cache, and publishes nothing. Must complete before the
    /// consumer starts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the replay read fails.
    pub async fn replay(&self) -> Result<usize, EngineError> {
        let mut inner = self.inner.lock().await;
        let events = self.store.replay(&self.scope, &self.config.agent_id)?;
        let count = events.len();
        for event in events {
            if event.tenant != self.scope.tenant || event.workspace != self.scope.workspace {
                warn!(
                    message_id = %event.message_id,
                    tenant = %event.tenant,
                    workspace = %event.workspace,
                    "skipping out-of-scope event during replay"
                );
                continue;
            }
            inner.adapter.apply(&event);
        }
        let keys = self.store.processed_keys(&self.scope)?;
        inner.processed.extend(keys);
        info!(
            events = count,
            keys = inner.processed.len(),
            agent = %self.config.agent_id,
            "replay complete"
        );
        Ok(count)
    }

    /// Forwards a periodic tick to the adapter with injected logical time.
    ///
    /// Tick outputs get the same egress rewrite, persistence, apply, and
    /// publish treatment as message outputs, each under its own idempotency
    /// key so crash replay stays exact.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for store or publish failures.
    pub async fn tick(&self, now_ms: i64) -> Result<Vec<EventEnvelope>, EngineError> {
        let mut inner = self.inner.lock().await;
        let mut outputs = inner.adapter.tick(now_ms);
        if outputs.is_empty() {
            return Ok(outputs);
        }
        for (i, output) in outputs.iter_mut().enumerate() {
            output.tenant = self.scope.tenant.clone();
            output.workspace = self.scope.workspace.clone();
            if output.ts.is_none() {
                output.ts = Some(now_ms);
            }
            if output.message_id.is_empty() {
                output.message_id = format!("{}-tick-{now_ms}-{i}", self.config.agent_id);
            }
            if output.idempotency_key.is_empty() {
                output.idempotency_key = format!("tick-{}-{now_ms}-{i}", self.config.agent_id);
            }
        }

        let mut emitted = Vec::with_capacity(outputs.len());
        for output in outputs {
            let key = output.idempotency_key.clone();
            if inner.processed.contains(&key) {
                continue;
            }
            let bumps = collect_entity_bumps(std::slice::from_ref(&output));
            let record = CommandRecord {
                key: &key,
                input: None,
                outputs: std::slice::from_ref(&output),
                audits: &[],
                entity_bumps: &bumps,
            };
            match self.store.append(&self.scope, &self.config.agent_id, &record) {
                Ok(()) => {}
                Err(StoreError::DuplicateIdempotencyKey { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
            inner.adapter.apply(&output);
            self.publish_all(std::slice::from_ref(&output)).await?;
            inner.processed.insert(key);
            emitted.push(output);
        }
        Ok(emitted)
    }

    /// SHA-256 hex hash of the adapter state's canonical JSON, which is
    /// the determinism oracle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Canonical`] when the state cannot be hashed.
    pub async fn state_hash(&self) -> Result<String, EngineError> {
        let inner = self.inner.lock().await;
        Ok(determinism::state_hash(&inner.adapter.state())?)
    }

    /// Snapshot of the adapter's state.
    pub async fn agent_state(&self) -> AgentState {
        self.inner.lock().await.adapter.state()
    }

    /// Adapter liveness report.
    pub async fn health(&self) -> HealthStatus {
        self.inner.lock().await.adapter.health()
    }

    async fn reject(
        &self,
        inner: &mut EngineInner,
        envelope: &EventEnvelope,
        kind: RejectionKind,
        reason: String,
    ) -> Result<ProcessOutcome, EngineError> {
        let key = effective_rejection_key(envelope);
        let violation = self.violation_event(envelope, &key, kind, &reason);

        let record = CommandRecord {
            key: &key,
            input: None,
            outputs: &[],
            audits: std::slice::from_ref(&violation),
            entity_bumps: &[],
        };
        match self.store.append(&self.scope, &self.config.agent_id, &record) {
            Ok(()) => {}
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                // Redelivered violation: the audit record is already
                // durable, republish it.
                if let Some(stored) = self.store.lookup_outputs(&self.scope, &key)? {
                    self.publish_all(&stored).await?;
                    inner.processed.insert(key);
                    return Ok(ProcessOutcome::Rejected {
                        violation: stored.into_iter().next().unwrap_or(violation),
                        kind,
                    });
                }
            }
            Err(other) => return Err(other.into()),
        }

        self.publish_all(std::slice::from_ref(&violation)).await?;
        inner.processed.insert(key);
        self.metrics.incr(Metric::SecurityViolations, 1);
        Ok(ProcessOutcome::Rejected { violation, kind })
    }

    async fn conflict(
        &self,
        inner: &mut EngineInner,
        envelope: &EventEnvelope,
        entity_id: &str,
        expected: u64,
        current: u64,
    ) -> Result<ProcessOutcome, EngineError> {
        let reason = format!(
            "version mismatch for entity {entity_id}: expected {expected}, got {current}"
        );
        warn!(%reason, "concurrency conflict");

        let mut payload = Map::new();
        payload.insert("entity_id".to_string(), json!(entity_id));
        payload.insert("expected_version".to_string(), json!(expected));
        payload.insert("current_version".to_string(), json!(current));
        payload.insert("reason".to_string(), json!("version_mismatch"));
        let mut event = envelope.derived(
            format!("{}-conflict", envelope.message_id),
            format!("evt.{}.conflict", self.config.agent_id),
            payload,
        );
        event.source.agent = self.config.agent_id.clone();
        event.source.adapter = "runtime".to_string();

        let key = envelope.idempotency_key.clone();
        let record = CommandRecord {
            key: &key,
            input: None,
            outputs: &[],
            audits: std::slice::from_ref(&event),
            entity_bumps: &[],
        };
        match self.store.append(&self.scope, &self.config.agent_id, &record) {
            Ok(()) => {}
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                if let Some(stored) = self.store.lookup_outputs(&self.scope, &key)? {
                    return self.republish_duplicate(&key, stored).await;
                }
            }
            Err(other) => return Err(other.into()),
        }

        self.publish_all(std::slice::from_ref(&event)).await?;
        inner.processed.insert(key);
        self.metrics.incr(Metric::ConcurrencyConflicts, 1);
        Ok(ProcessOutcome::Conflict { event })
    }

    async fn adapter_failure(
        &self,
        inner: &mut EngineInner,
        envelope: &EventEnvelope,
        error: &crate::adapter::AdapterError,
    ) -> Result<ProcessOutcome, EngineError> {
        warn!(code = %error.code, message = %error.message, "adapter failure");
        let mut payload = Map::new();
        payload.insert("error_code".to_string(), json!(error.code));
        payload.insert("message".to_string(), json!(error.message));
        payload.insert(
            "original_event_id".to_string(),
            json!(envelope.message_id),
        );
        let mut event = envelope.derived(
            format!("{}-error", envelope.message_id),
            "evt.runtime.error",
            payload,
        );
        event.source.agent = self.config.agent_id.clone();
        event.source.adapter = "runtime".to_string();

        let key = envelope.idempotency_key.clone();
        let record = CommandRecord {
            key: &key,
            input: Some(envelope),
            outputs: &[],
            audits: std::slice::from_ref(&event),
            entity_bumps: &[],
        };
        match self.store.append(&self.scope, &self.config.agent_id, &record) {
            Ok(()) => {}
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                if let Some(stored) = self.store.lookup_outputs(&self.scope, &key)? {
                    return self.republish_duplicate(&key, stored).await;
                }
            }
            Err(other) => return Err(other.into()),
        }

        self.publish_all(std::slice::from_ref(&event)).await?;
        inner.processed.insert(key);
        self.metrics.incr(Metric::AdapterFailures, 1);
        Ok(ProcessOutcome::Failed { error_event: event })
    }

    async fn republish_duplicate(
        &self,
        key: &str,
        outputs: Vec<EventEnvelope>,
    ) -> Result<ProcessOutcome, EngineError> {
        debug!(%key, outputs = outputs.len(), "idempotency hit, republishing stored outputs");
        self.metrics.incr(Metric::IdempotencyHits, 1);
        self.publish_all(&outputs).await?;
        Ok(ProcessOutcome::Duplicate { outputs })
    }

    fn rewrite_egress(&self, parent: &EventEnvelope, outputs: &mut [EventEnvelope]) {
        for (i, output) in outputs.iter_mut().enumerate() {
            output.tenant = self.scope.tenant.clone();
            output.workspace = self.scope.workspace.clone();
            output.security_context = parent.security_context.clone();
            output.causation_id = Some(parent.message_id.clone());
            output.correlation_id = parent.correlation_id.clone();
            output.trace_id = parent.trace_id.clone();
            if output.ts.is_none() {
                output.ts = parent.ts.or_else(|| Some(self.now_ms()));
            }
            if output.message_id.is_empty() {
                output.message_id = format!("{}-out-{i}", parent.message_id);
            }
            if output.idempotency_key.is_empty() {
                output.idempotency_key = parent.idempotency_key.clone();
            }
            if output.source.agent.is_empty() {
                output.source.agent = self.config.agent_id.clone();
            }
            if output.source.adapter.is_empty() {
                output.source.adapter = "runtime".to_string();
            }
        }
    }

    async fn publish_all(&self, envelopes: &[EventEnvelope]) -> Result<(), EngineError> {
        for envelope in envelopes {
            if envelope.is_command() {
                self.router.route(envelope).await?;
                self.metrics.incr(Metric::CommandsSent, 1);
            } else {
                self.bus.publish(envelope).await?;
                self.metrics.incr(Metric::EventsEmitted, 1);
            }
        }
        Ok(())
    }

    fn violation_event(
        &self,
        envelope: &EventEnvelope,
        key: &str,
        kind: RejectionKind,
        reason: &str,
    ) -> EventEnvelope {
        let mut payload = Map::new();
        payload.insert("message_id".to_string(), json!(envelope.message_id));
        payload.insert("code".to_string(), json!(kind.code()));
        payload.insert("reason".to_string(), json!(reason));
        payload.insert("attempted_tenant".to_string(), json!(envelope.tenant));
        payload.insert(
            "attempted_workspace".to_string(),
            json!(envelope.workspace),
        );
        payload.insert("type".to_string(), json!(envelope.event_type));

        let security_context = if envelope.security_context.is_valid() {
            envelope.security_context.clone()
        } else {
            SecurityContext::system(self.config.agent_id.clone())
        };

        EventEnvelope {
            message_id: format!("{}-violation", envelope.message_id),
            ts: Some(envelope.ts.unwrap_or_else(|| self.now_ms())),
            event_type: "evt.security.violation".to_string(),
            schema_version: crate::envelope::SCHEMA_VERSION.to_string(),
            tenant: self.scope.tenant.clone(),
            workspace: self.scope.workspace.clone(),
            security_context,
            actor: envelope.actor.clone(),
            source: crate::envelope::Source {
                agent: self.config.agent_id.clone(),
                adapter: "runtime".to_string(),
            },
            payload,
            idempotency_key: key.to_string(),
            correlation_id: envelope.correlation_id.clone(),
            causation_id: Some(envelope.message_id.clone()),
            trace_id: envelope.trace_id.clone(),
            span_id: envelope.span_id.clone(),
            entity_id: None,
            expected_version: None,
            reply_to: None,
            extensions: Map::new(),
        }
    }

    fn observe_duration(&self, started: std::time::Instant) {
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics
            .observe_duration_ms(Metric::ProcessingDurationMs, elapsed);
    }
}

/// Key under which a rejected envelope is filed when its own key is
/// unusable.
fn effective_rejection_key(envelope: &EventEnvelope) -> String {
    if !envelope.idempotency_key.is_empty() {
        return envelope.idempotency_key.clone();
    }
    if !envelope.message_id.is_empty() {
        return format!("violation-{}", envelope.message_id);
    }
    format!(
        "violation-{}",
        determinism::derive_token(&format!(
            "{}|{}|{}",
            envelope.event_type,
            envelope.tenant,
            envelope.workspace
        ))
    )
}
