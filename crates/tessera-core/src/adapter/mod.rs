//! The agent adapter contract.
//!
//! An adapter is the decision/apply logic of a hosted agent. The engine
//! drives it through four operations:
//!
//! - [`decide`](AgentAdapter::decide): pure translation of an inbound
//!   envelope into candidate output envelopes. No I/O and no wall clock;
//!   logical time arrives on the envelope `ts`.
//! - [`apply`](AgentAdapter::apply): folds a committed output envelope into
//!   in-memory state. This is the only place state changes, both live and
//!   during replay.
//! - [`tick`](AgentAdapter::tick): periodic hook for time-based logic,
//!   driven with injected logical time.
//! - [`state`](AgentAdapter::state) / [`health`](AgentAdapter::health):
//!   state read for hashing and liveness reporting.

pub mod testing;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// Failure raised by an adapter's decision logic.
///
/// The engine converts this into an `evt.runtime.error` audit record and
/// acknowledges the message; it is an application failure, not a transport
/// failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("adapter failure [{code}]: {message}")]
pub struct AdapterError {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl AdapterError {
    /// Creates an adapter error from a code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Adapter liveness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// The adapter is serving.
    Ready,
    /// The adapter is serving with reduced capability.
    Degraded,
    /// The adapter cannot serve.
    Failed,
}

/// Snapshot of an adapter's in-memory state.
///
/// `data` is opaque to the engine; its canonical-JSON hash is the
/// determinism oracle. In deterministic mode `updated_at` carries logical
/// time and must match across replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Monotonically increasing state version.
    pub version: u64,
    /// Opaque adapter state.
    pub data: Map<String, Value>,
    /// Identifier of the last applied envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_event_id: Option<String>,
    /// Logical timestamp of the last state change (milliseconds).
    pub updated_at: i64,
}

impl AgentState {
    /// An empty state at version zero.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            data: Map::new(),
            last_processed_event_id: None,
            updated_at: 0,
        }
    }
}

/// Contract every hosted agent implements.
///
/// `decide` and `tick` must be pure functions of their arguments and the
/// current state; `apply` must be a pure fold. Adapters that need I/O are
/// modeled as separate agents reached via events. Collection outputs must be
/// in a content-defined order (e.g. sorted by entity id) so that replay is
/// byte-stable.
pub trait AgentAdapter: Send {
    /// Translates an inbound envelope into candidate output envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] for application failures; the engine
    /// persists an `evt.runtime.error` and acknowledges the message.
    fn decide(&self, envelope: &EventEnvelope) -> Result<Vec<EventEnvelope>, AdapterError>;

    /// Folds a committed output envelope into in-memory state.
    fn apply(&mut self, envelope: &EventEnvelope);

    /// Periodic hook for time-based logic, with injected logical time.
    fn tick(&self, now_ms: i64) -> Vec<EventEnvelope>;

    /// Snapshot of the current state.
    fn state(&self) -> AgentState;

    /// Liveness report.
    fn health(&self) -> HealthStatus;
}
