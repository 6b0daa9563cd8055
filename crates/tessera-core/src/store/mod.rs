//! The scoped, append-only event store.
//!
//! Every command processed by an engine is committed as one atomic record:
//! the inbound envelope, the output envelopes emitted while processing its
//! idempotency key, any engine-authored audit records, and the entity-version
//! bumps the outputs carry. The store is both the recovery substrate (a
//! redelivered command finds its stored outputs and republishes them instead
//! of re-deciding) and the replay source for rebuilding adapter state.
//!
//! Every read is filtered by `(tenant, workspace)`; the API makes an
//! unscoped query unrepresentable.

mod sqlite;


pub use sqlite::SqliteEventStore;

use thiserror::Error;

use crate::envelope::{EventEnvelope, Scope};

/// Errors raised by event store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An idempotency key was appended twice within one scope.
    #[error("duplicate idempotency key '{key}' in scope {scope}")]
    DuplicateIdempotencyKey {
        /// The colliding key.
        key: String,
        /// The scope the collision happened in.
        scope: String,
    },

    /// A stored row could not be decoded back into an envelope.
    #[error("corrupt stored record at seq {seq}: {message}")]
    CorruptRecord {
        /// Sequence number of the bad row.
        seq: u64,
        /// Description of the decode failure.
        message: String,
    },

    /// The record to append is missing an engine-injected timestamp.
    #[error("envelope '{message_id}' reached the store without a timestamp")]
    MissingTimestamp {
        /// Identifier of the offending envelope.
        message_id: String,
    },
}

/// Role of a stored envelope row.
///
/// Only `output` rows participate in replay; `audit` rows (violations,
/// conflicts, runtime errors) are republishable but never applied, and
/// `input` rows exist for audit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRole {
    /// The inbound command envelope.
    Input,
    /// An adapter-produced side effect.
    Output,
    /// An engine-authored audit record.
    Audit,
}

impl RowRole {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Audit => "audit",
        }
    }
}

/// One command's atomic commit unit.
#[derive(Debug, Clone, Copy)]
pub struct CommandRecord<'a> {
    /// Idempotency key the record is filed under.
    pub key: &'a str,
    /// The inbound envelope, when it may be persisted (isolation forbids
    /// storing out-of-scope inputs).
    pub input: Option<&'a EventEnvelope>,
    /// Adapter-produced outputs, in emission order.
    pub outputs: &'a [EventEnvelope],
    /// Engine-authored audit records.
    pub audits: &'a [EventEnvelope],
    /// Entity-version bumps carried by the outputs.
    pub entity_bumps: &'a [(String, u64)],
}

/// Contract for event store backends.
///
/// Implementations must preserve append-only ordering and atomic multi-row
/// commit per idempotency key. The store never evicts.
pub trait EventStore: Send + Sync {
    /// Atomically appends one command record under `scope` for `agent`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateIdempotencyKey`] when the key was
    /// already committed in this scope, and backend errors otherwise.
    fn append(&self, scope: &Scope, agent: &str, record: &CommandRecord<'_>)
        -> Result<(), StoreError>;

    /// Looks up the republishable envelopes stored under an idempotency key.
    ///
    /// Returns `None` when the key has never been committed in this scope,
    /// and `Some` (possibly empty) when it has; the distinction lets a
    /// redelivered rejected command acknowledge quietly.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    fn lookup_outputs(
        &self,
        scope: &Scope,
        key: &str,
    ) -> Result<Option<Vec<EventEnvelope>>, StoreError>;

    /// Current committed version of an entity, if any.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    fn current_entity_version(
        &self,
        scope: &Scope,
        agent: &str,
        entity_id: &str,
    ) -> Result<Option<u64>, StoreError>;

    /// Ordered stream of applied (output-role) envelopes for state rebuild.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    fn replay(&self, scope: &Scope, agent: &str) -> Result<Vec<EventEnvelope>, StoreError>;

    /// All idempotency keys committed in a scope, for cache warm-up.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    fn processed_keys(&self, scope: &Scope) -> Result<Vec<String>, StoreError>;
}
