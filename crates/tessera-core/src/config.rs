//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::envelope::Scope;

/// Configuration for one engine instance.
///
/// The core has no CLI or environment surface; an embedding binary builds
/// this record however it likes. Exactly one engine instance may exist per
/// `(tenant, workspace, agent_id)`: the command stream's work-queue
/// retention guarantees at-most-one live consumer, and a second instance
/// would starve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Tenant isolation key.
    pub tenant: String,

    /// Workspace isolation key.
    pub workspace: String,

    /// Agent this engine hosts.
    pub agent_id: String,

    /// When set, the injected clock returns a fixed logical time and state
    /// hashes must match exactly across replays.
    #[serde(default)]
    pub deterministic: bool,

    /// Redeliveries before a message is dead-lettered.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,

    /// Progressive backoff between redeliveries, in milliseconds.
    #[serde(default = "default_backoff_schedule_ms")]
    pub backoff_schedule_ms: Vec<u64>,

    /// How long a delivery may stay unacknowledged before the transport
    /// redelivers, in milliseconds.
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,

    /// Per-message processing deadline, in milliseconds. On expiry the
    /// engine does not acknowledge and relies on redelivery.
    #[serde(default = "default_process_deadline_ms")]
    pub process_deadline_ms: u64,

    /// Suggested interval between `tick` invocations, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Event store DSN: `":memory:"` or a filesystem path.
    #[serde(default = "default_store_dsn")]
    pub store_dsn: String,
}

const fn default_max_deliver() -> u32 {
    5
}

fn default_backoff_schedule_ms() -> Vec<u64> {
    vec![1_000, 5_000, 10_000, 30_000, 60_000]
}

const fn default_ack_wait_ms() -> u64 {
    30_000
}

const fn default_process_deadline_ms() -> u64 {
    30_000
}

const fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_store_dsn() -> String {
    ":memory:".to_string()
}

impl RuntimeConfig {
    /// Creates a config for a scope and agent with default tuning.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        workspace: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            workspace: workspace.into(),
            agent_id: agent_id.into(),
            deterministic: false,
            max_deliver: default_max_deliver(),
            backoff_schedule_ms: default_backoff_schedule_ms(),
            ack_wait_ms: default_ack_wait_ms(),
            process_deadline_ms: default_process_deadline_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            store_dsn: default_store_dsn(),
        }
    }

    /// Switches the engine into deterministic mode.
    #[must_use]
    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    /// The engine's isolation scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.tenant.clone(), self.workspace.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_minimal_json() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"tenant": "t1", "workspace": "w1", "agent_id": "orders"}"#,
        )
        .expect("deserialize");
        assert!(!config.deterministic);
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.backoff_schedule_ms, vec![1_000, 5_000, 10_000, 30_000, 60_000]);
        assert_eq!(config.store_dsn, ":memory:");
        assert_eq!(config.scope().to_string(), "t1/w1");
    }
}
