//! The canonical event envelope.
//!
//! Every message exchanged between components is an immutable
//! [`EventEnvelope`], whether it is a command intent (`cmd.*`), a fact
//! notification (`evt.*`), a query (`qry.*`), or a response (`res.*`).
//! The envelope carries identity,
//! lineage, isolation scope, the security context stamped by a trusted
//! upstream, an opaque payload, and the idempotency key under which its
//! effects are deduplicated.
//!
//! Unknown fields are preserved in the `extensions` map for forward
//! compatibility but never interpreted by the core.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fixed envelope schema version tag.
pub const SCHEMA_VERSION: &str = "1.0";

/// Errors raised by envelope contract validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// A required field is empty or missing.
    #[error("missing required envelope field: {field}")]
    MissingField {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The type tag does not start with a known namespace prefix.
    #[error("unknown type namespace in '{type_tag}'")]
    UnknownNamespace {
        /// The full type tag that failed to parse.
        type_tag: String,
    },

    /// The type tag has too few dotted segments to address an agent.
    #[error("type tag '{type_tag}' must be '<ns>.<agent>.<verb>'")]
    MalformedType {
        /// The full type tag that failed to parse.
        type_tag: String,
    },
}

/// The namespace prefix of an envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeNamespace {
    /// A command intent (`cmd.*`), routed through the command router.
    Command,
    /// A fact notification (`evt.*`), published on the event bus.
    Event,
    /// A query (`qry.*`).
    Query,
    /// A response (`res.*`).
    Response,
}

impl TypeNamespace {
    /// Parses the namespace prefix of a dotted type tag.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnknownNamespace`] for any prefix other than
    /// `cmd`, `evt`, `qry`, or `res`.
    pub fn parse(type_tag: &str) -> Result<Self, EnvelopeError> {
        match type_tag.split('.').next() {
            Some("cmd") => Ok(Self::Command),
            Some("evt") => Ok(Self::Event),
            Some("qry") => Ok(Self::Query),
            Some("res") => Ok(Self::Response),
            _ => Err(EnvelopeError::UnknownNamespace {
                type_tag: type_tag.to_string(),
            }),
        }
    }

    /// The wire prefix for this namespace.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Command => "cmd",
            Self::Event => "evt",
            Self::Query => "qry",
            Self::Response => "res",
        }
    }
}

/// The kind of principal a security context describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// A human user.
    User,
    /// A backend service.
    Service,
    /// A hosted agent.
    Agent,
    /// The runtime itself.
    System,
}

/// Security context stamped by a trusted upstream.
///
/// The engine validates presence but does not authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Identifier of the acting principal.
    pub principal_id: String,
    /// Kind of the acting principal.
    pub principal_type: PrincipalType,
}

impl SecurityContext {
    /// A system-level context used for runtime-authored records.
    #[must_use]
    pub fn system(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            principal_type: PrincipalType::System,
        }
    }

    /// Whether the context names a principal.
    ///
    /// An empty principal is a security violation at ingress, checked in
    /// the same step as the tenant/workspace scope, not a contract error.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.principal_id.is_empty()
    }
}

/// Free-form identification of the emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Emitter identifier.
    pub id: String,
    /// Emitter role.
    pub role: String,
}

/// Originating component identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Agent that produced the envelope.
    pub agent: String,
    /// Adapter that produced the envelope.
    pub adapter: String,
}

/// The `(tenant, workspace)` pair bounding an engine instance and every
/// record it touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant isolation key.
    pub tenant: String,
    /// Workspace isolation key.
    pub workspace: String,
}

impl Scope {
    /// Creates a scope from its two keys.
    #[must_use]
    pub fn new(tenant: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            workspace: workspace.into(),
        }
    }

    /// Whether an envelope claims this scope.
    #[must_use]
    pub fn admits(&self, envelope: &EventEnvelope) -> bool {
        envelope.tenant == self.tenant && envelope.workspace == self.workspace
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.workspace)
    }
}

/// Canonical immutable message record.
///
/// Field semantics follow the envelope contract: `message_id` is stable
/// across redeliveries, `ts` is a logical millisecond timestamp injected by
/// the engine when absent, and `idempotency_key` is the fingerprint under
/// which effects are deduplicated within a `(tenant, workspace)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier, stable across redeliveries.
    pub message_id: String,

    /// Logical timestamp (milliseconds). Engine-injected when absent; never
    /// read from wall clock inside adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// Dotted type tag, namespace-prefixed (`cmd.*`, `evt.*`, `qry.*`,
    /// `res.*`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Envelope schema version tag.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Tenant isolation key.
    pub tenant: String,

    /// Workspace isolation key.
    pub workspace: String,

    /// Security context stamped by a trusted upstream.
    pub security_context: SecurityContext,

    /// Free-form emitter identification.
    pub actor: Actor,

    /// Originating component identifiers.
    pub source: Source,

    /// Opaque, type-specific payload.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Fingerprint under which effects are deduplicated.
    pub idempotency_key: String,

    /// Workflow lineage identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Identifier of the predecessor envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Observability trace propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Observability span propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Optional concurrency-check target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Asserted current version of `entity_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,

    /// Optional subject for synchronous-style response delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Unknown fields, preserved for forward compatibility and never
    /// interpreted by the core.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl EventEnvelope {
    /// Validates the envelope contract and returns the parsed namespace.
    ///
    /// Security-context validity is deliberately not part of the contract:
    /// the engine checks it in the same ingress step as the
    /// tenant/workspace scope (see [`SecurityContext::is_valid`]).
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] when a required field is empty, the type
    /// namespace is unknown, or the type tag cannot address an agent.
    pub fn validate(&self) -> Result<TypeNamespace, EnvelopeError> {
        for (field, value) in [
            ("message_id", &self.message_id),
            ("type", &self.event_type),
            ("tenant", &self.tenant),
            ("workspace", &self.workspace),
            ("idempotency_key", &self.idempotency_key),
        ] {
            if value.is_empty() {
                return Err(EnvelopeError::MissingField { field });
            }
        }
        let namespace = TypeNamespace::parse(&self.event_type)?;
        if self.event_type.splitn(3, '.').count() < 3 {
            return Err(EnvelopeError::MalformedType {
                type_tag: self.event_type.clone(),
            });
        }
        Ok(namespace)
    }

    /// The namespace of this envelope's type tag, if known.
    #[must_use]
    pub fn namespace(&self) -> Option<TypeNamespace> {
        TypeNamespace::parse(&self.event_type).ok()
    }

    /// Whether this envelope is a command intent.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.namespace() == Some(TypeNamespace::Command)
    }

    /// The agent segment of the type tag (`cmd.<agent>.<verb>`).
    #[must_use]
    pub fn target_agent(&self) -> Option<&str> {
        self.event_type.split('.').nth(1)
    }

    /// The verb segments of the type tag past the agent.
    #[must_use]
    pub fn verb(&self) -> Option<&str> {
        self.event_type.splitn(3, '.').nth(2)
    }

    /// The entity-version bump an output envelope carries, if any.
    ///
    /// A successful mutation names its entity through the envelope
    /// `entity_id` (or a payload `entity_id` fallback) and the new version
    /// through a payload `entity_version`.
    #[must_use]
    pub fn entity_bump(&self) -> Option<(String, u64)> {
        let version = self.payload.get("entity_version")?.as_u64()?;
        let entity_id = self
            .entity_id
            .clone()
            .or_else(|| {
                self.payload
                    .get("entity_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })?;
        Some((entity_id, version))
    }

    /// Builds a child envelope derived from this one.
    ///
    /// The child inherits scope, security context, actor, lineage, and
    /// logical time; `causation_id` is set to this envelope's `message_id`
    /// and the idempotency key is shared so that crash replay finds the
    /// child under the parent command's key.
    #[must_use]
    pub fn derived(
        &self,
        message_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            ts: self.ts,
            event_type: event_type.into(),
            schema_version: SCHEMA_VERSION.to_string(),
            tenant: self.tenant.clone(),
            workspace: self.workspace.clone(),
            security_context: self.security_context.clone(),
            actor: self.actor.clone(),
            source: self.source.clone(),
            payload,
            idempotency_key: self.idempotency_key.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(self.message_id.clone()),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            entity_id: None,
            expected_version: None,
            reply_to: None,
            extensions: Map::new(),
        }
    }
}

/// Collects the distinct `(entity_id, version)` bumps from a batch of
/// output envelopes, last write per entity winning.
#[must_use]
pub fn collect_entity_bumps(outputs: &[EventEnvelope]) -> Vec<(String, u64)> {
    let mut seen = HashSet::new();
    let mut bumps = Vec::new();
    for output in outputs.iter().rev() {
        if let Some((entity_id, version)) = output.entity_bump() {
            if seen.insert(entity_id.clone()) {
                bumps.push((entity_id, version));
            }
        }
    }
    bumps.reverse();
    bumps
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            message_id: "msg-1".to_string(),
            ts: Some(1_000),
            event_type: event_type.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            tenant: "t1".to_string(),
            workspace: "w1".to_string(),
            security_context: SecurityContext {
                principal_id: "alice".to_string(),
                principal_type: PrincipalType::User,
            },
            actor: Actor {
                id: "alice".to_string(),
                role: "tester".to_string(),
            },
            source: Source {
                agent: "orders".to_string(),
                adapter: "test".to_string(),
            },
            payload: Map::new(),
            idempotency_key: "k1".to_string(),
            correlation_id: None,
            causation_id: None,
            trace_id: None,
            span_id: None,
            entity_id: None,
            expected_version: None,
            reply_to: None,
            extensions: Map::new(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_command() {
        let env = envelope("cmd.orders.create");
        assert_eq!(env.validate(), Ok(TypeNamespace::Command));
    }

    #[test]
    fn validate_rejects_unknown_namespace() {
        let env = envelope("job.orders.create");
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::UnknownNamespace { .. })
        ));
    }

    #[test]
    fn validate_rejects_short_type_tag() {
        let env = envelope("cmd.orders");
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MalformedType { .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_tenant() {
        let mut env = envelope("cmd.orders.create");
        env.tenant = String::new();
        assert_eq!(
            env.validate(),
            Err(EnvelopeError::MissingField { field: "tenant" })
        );
    }

    #[test]
    fn empty_principal_fails_the_security_check_not_the_contract() {
        let mut env = envelope("cmd.orders.create");
        env.security_context.principal_id = String::new();
        assert!(!env.security_context.is_valid());
        assert_eq!(env.validate(), Ok(TypeNamespace::Command));
    }

    #[test]
    fn type_tag_accessors() {
        let env = envelope("cmd.orders.create.draft");
        assert!(env.is_command());
        assert_eq!(env.target_agent(), Some("orders"));
        assert_eq!(env.verb(), Some("create.draft"));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = json!({
            "message_id": "m1",
            "type": "evt.orders.created",
            "tenant": "t1",
            "workspace": "w1",
            "security_context": {"principal_id": "svc", "principal_type": "service"},
            "actor": {"id": "svc", "role": "writer"},
            "source": {"agent": "orders", "adapter": "test"},
            "payload": {},
            "idempotency_key": "k1",
            "x_future_field": {"nested": true}
        });
        let env: EventEnvelope = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(env.extensions.get("x_future_field"), Some(&json!({"nested": true})));
        let back = serde_json::to_value(&env).expect("serialize");
        assert_eq!(back.get("x_future_field"), Some(&json!({"nested": true})));
    }

    #[test]
    fn entity_bump_reads_envelope_and_payload() {
        let mut env = envelope("evt.orders.updated");
        env.entity_id = Some("e1".to_string());
        env.payload
            .insert("entity_version".to_string(), json!(4));
        assert_eq!(env.entity_bump(), Some(("e1".to_string(), 4)));

        let mut env = envelope("evt.orders.updated");
        env.payload.insert("entity_id".to_string(), json!("e2"));
        env.payload.insert("entity_version".to_string(), json!(7));
        assert_eq!(env.entity_bump(), Some(("e2".to_string(), 7)));
    }

    #[test]
    fn derived_inherits_lineage_and_key() {
        let mut parent = envelope("cmd.orders.create");
        parent.correlation_id = Some("corr-1".to_string());
        parent.trace_id = Some("trace-1".to_string());
        let child = parent.derived("m2", "evt.orders.created", Map::new());
        assert_eq!(child.causation_id.as_deref(), Some("msg-1"));
        assert_eq!(child.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(child.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(child.idempotency_key, "k1");
        assert_eq!(child.tenant, "t1");
    }

    #[test]
    fn last_bump_per_entity_wins() {
        let mut first = envelope("evt.orders.updated");
        first.entity_id = Some("e1".to_string());
        first.payload.insert("entity_version".to_string(), json!(4));
        let mut second = envelope("evt.orders.updated");
        second.entity_id = Some("e1".to_string());
        second
            .payload
            .insert("entity_version".to_string(), json!(5));
        let bumps = collect_entity_bumps(&[first, second]);
        assert_eq!(bumps, vec![("e1".to_string(), 5)]);
    }
}
