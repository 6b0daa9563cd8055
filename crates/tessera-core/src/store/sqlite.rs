//! `SQLite`-backed event store.
//!
//! The reference backend: a single `SQLite` database in WAL mode, guarded by
//! a mutex. All multi-row commits for one idempotency key happen inside a
//! single transaction, so a crash leaves either the whole record or nothing.

// SQLite returns i64 for row ids and counts; values here are non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Value};

use super::{CommandRecord, EventStore, RowRole, StoreError};
use crate::envelope::{Actor, EventEnvelope, Scope, SecurityContext, Source};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The append-only event store backed by `SQLite`.
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Opens or creates a store at the specified path.
    ///
    /// WAL mode is enabled for concurrent reads while writes are in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store, mostly for tests and local development.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a store from a DSN: `":memory:"` or a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn from_dsn(dsn: &str) -> Result<Self, StoreError> {
        if dsn == ":memory:" {
            Self::in_memory()
        } else {
            Self::open(dsn)
        }
    }

    fn insert_envelope(
        tx: &rusqlite::Transaction<'_>,
        role: RowRole,
        agent: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError> {
        let ts = envelope.ts.ok_or_else(|| StoreError::MissingTimestamp {
            message_id: envelope.message_id.clone(),
        })?;
        let extensions_json = if envelope.extensions.is_empty() {
            None
        } else {
            Some(encode_json(&envelope.extensions, &envelope.message_id)?)
        };
        tx.execute(
            "INSERT INTO events (role, agent, message_id, ts, type, schema_version, tenant, workspace,
                                 security_context_json, actor_json, source_json, payload_json,
                                 idempotency_key, record_key, correlation_id, causation_id, trace_id,
                                 span_id, entity_id, expected_version, reply_to, extensions_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                role.as_str(),
                agent,
                envelope.message_id,
                ts,
                envelope.event_type,
                envelope.schema_version,
                envelope.tenant,
                envelope.workspace,
                encode_json(&envelope.security_context, &envelope.message_id)?,
                encode_json(&envelope.actor, &envelope.message_id)?,
                encode_json(&envelope.source, &envelope.message_id)?,
                encode_json(&envelope.payload, &envelope.message_id)?,
                envelope.idempotency_key,
                key,
                envelope.correlation_id,
                envelope.causation_id,
                envelope.trace_id,
                envelope.span_id,
                envelope.entity_id,
                envelope.expected_version.map(|v| v as i64),
                envelope.reply_to,
                extensions_json,
            ],
        )?;
        Ok(())
    }

    fn select_envelopes<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(RawRow {
                    seq: row.get::<_, i64>(0)? as u64,
                    message_id: row.get(1)?,
                    ts: row.get(2)?,
                    event_type: row.get(3)?,
                    schema_version: row.get(4)?,
                    tenant: row.get(5)?,
                    workspace: row.get(6)?,
                    security_context_json: row.get(7)?,
                    actor_json: row.get(8)?,
                    source_json: row.get(9)?,
                    payload_json: row.get(10)?,
                    idempotency_key: row.get(11)?,
                    correlation_id: row.get(12)?,
                    causation_id: row.get(13)?,
                    trace_id: row.get(14)?,
                    span_id: row.get(15)?,
                    entity_id: row.get(16)?,
                    expected_version: row.get::<_, Option<i64>>(17)?,
                    reply_to: row.get(18)?,
                    extensions_json: row.get(19)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawRow::into_envelope).collect()
    }
}

/// Column list shared by every envelope select.
const ENVELOPE_COLUMNS: &str = "seq, message_id, ts, type, schema_version, tenant, workspace, \
     security_context_json, actor_json, source_json, payload_json, idempotency_key, \
     correlation_id, causation_id, trace_id, span_id, entity_id, expected_version, reply_to, \
     extensions_json";

struct RawRow {
    seq: u64,
    message_id: String,
    ts: i64,
    event_type: String,
    schema_version: String,
    tenant: String,
    workspace: String,
    security_context_json: String,
    actor_json: String,
    source_json: String,
    payload_json: String,
    idempotency_key: String,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    entity_id: Option<String>,
    expected_version: Option<i64>,
    reply_to: Option<String>,
    extensions_json: Option<String>,
}

impl RawRow {
    fn into_envelope(self) -> Result<EventEnvelope, StoreError> {
        let seq = self.seq;
        let corrupt = |message: String| StoreError::CorruptRecord { seq, message };

        let security_context: SecurityContext =
            serde_json::from_str(&self.security_context_json)
                .map_err(|e| corrupt(format!("security_context: {e}")))?;
        let actor: Actor =
            serde_json::from_str(&self.actor_json).map_err(|e| corrupt(format!("actor: {e}")))?;
        let source: Source =
            serde_json::from_str(&self.source_json).map_err(|e| corrupt(format!("source: {e}")))?;
        let payload: Map<String, Value> = serde_json::from_str(&self.payload_json)
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        let extensions: Map<String, Value> = match self.extensions_json {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| corrupt(format!("extensions: {e}")))?
            }
            None => Map::new(),
        };

        Ok(EventEnvelope {
            message_id: self.message_id,
            ts: Some(self.ts),
            event_type: self.event_type,
            schema_version: self.schema_version,
            tenant: self.tenant,
            workspace: self.workspace,
            security_context,
            actor,
            source,
            payload,
            idempotency_key: self.idempotency_key,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            entity_id: self.entity_id,
            expected_version: self.expected_version.map(|v| v as u64),
            reply_to: self.reply_to,
            extensions,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T, message_id: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::CorruptRecord {
        seq: 0,
        message: format!("encoding envelope '{message_id}': {e}"),
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl EventStore for SqliteEventStore {
    fn append(
        &self,
        scope: &Scope,
        agent: &str,
        record: &CommandRecord<'_>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let recorded_ts = record
            .input
            .and_then(|e| e.ts)
            .or_else(|| record.outputs.first().and_then(|e| e.ts))
            .or_else(|| record.audits.first().and_then(|e| e.ts))
            .unwrap_or(0);

        let inserted = tx.execute(
            "INSERT INTO command_log (tenant, workspace, idempotency_key, agent, output_count, recorded_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.tenant,
                scope.workspace,
                record.key,
                agent,
                record.outputs.len() as i64,
                recorded_ts,
            ],
        );
        if let Err(err) = inserted {
            if is_constraint_violation(&err) {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: record.key.to_string(),
                    scope: scope.to_string(),
                });
            }
            return Err(err.into());
        }

        if let Some(input) = record.input {
            Self::insert_envelope(&tx, RowRole::Input, agent, record.key, input)?;
        }
        for output in record.outputs {
            Self::insert_envelope(&tx, RowRole::Output, agent, record.key, output)?;
        }
        for audit in record.audits {
            Self::insert_envelope(&tx, RowRole::Audit, agent, record.key, audit)?;
        }
        for (entity_id, version) in record.entity_bumps {
            tx.execute(
                "INSERT INTO entity_versions (tenant, workspace, agent, entity_id, current_version)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (tenant, workspace, agent, entity_id)
                 DO UPDATE SET current_version = excluded.current_version",
                params![
                    scope.tenant,
                    scope.workspace,
                    agent,
                    entity_id,
                    *version as i64
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn lookup_outputs(
        &self,
        scope: &Scope,
        key: &str,
    ) -> Result<Option<Vec<EventEnvelope>>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let seen: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM command_log WHERE tenant = ?1 AND workspace = ?2 AND idempotency_key = ?3",
                params![scope.tenant, scope.workspace, key],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_none() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {ENVELOPE_COLUMNS} FROM events
             WHERE tenant = ?1 AND workspace = ?2 AND record_key = ?3
               AND role IN ('output', 'audit')
             ORDER BY seq ASC"
        );
        let outputs =
            Self::select_envelopes(&conn, &sql, params![scope.tenant, scope.workspace, key])?;
        Ok(Some(outputs))
    }

    fn current_entity_version(
        &self,
        scope: &Scope,
        agent: &str,
        entity_id: &str,
    ) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let version: Option<i64> = conn
            .query_row(
                "SELECT current_version FROM entity_versions
                 WHERE tenant = ?1 AND workspace = ?2 AND agent = ?3 AND entity_id = ?4",
                params![scope.tenant, scope.workspace, agent, entity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn replay(&self, scope: &Scope, agent: &str) -> Result<Vec<EventEnvelope>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let sql = format!(
            "SELECT {ENVELOPE_COLUMNS} FROM events
             WHERE tenant = ?1 AND workspace = ?2 AND agent = ?3 AND role = 'output'
             ORDER BY seq ASC"
        );
        Self::select_envelopes(&conn, &sql, params![scope.tenant, scope.workspace, agent])
    }

    fn processed_keys(&self, scope: &Scope) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT idempotency_key FROM command_log
             WHERE tenant = ?1 AND workspace = ?2
             ORDER BY rowid ASC",
        )?;
        let keys = stmt
            .query_map(params![scope.tenant, scope.workspace], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}
