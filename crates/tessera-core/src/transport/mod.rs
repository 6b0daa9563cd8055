//! Durable transport contracts and subject grammar.
//!
//! Two publish surfaces exist: the event bus (`evt.*` and other fact
//! notifications, limits retention) and the command router (`cmd.*`,
//! work-queue retention; each command is drained by exactly one consumer).
//! Both address messages through the subject grammar
//! `<ns>.<tenant>.<workspace>.<agent>.<verb>`; dead letters land on
//! `failed.<original_subject>`.
//!
//! The in-memory implementations in [`memory`] mirror the durable
//! semantics closely enough to exercise redelivery, backoff, and
//! dead-lettering in tests without a broker.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{EventEnvelope, TypeNamespace};

/// Errors raised by transport operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// A publish to the event bus failed.
    #[error("publish to '{subject}' failed: {reason}")]
    Publish {
        /// Destination subject.
        subject: String,
        /// Backend failure description.
        reason: String,
    },

    /// Routing a command failed.
    #[error("routing to '{subject}' failed: {reason}")]
    Route {
        /// Destination subject.
        subject: String,
        /// Backend failure description.
        reason: String,
    },

    /// The envelope type tag cannot be mapped onto a subject.
    #[error("type tag '{type_tag}' cannot be mapped to a subject")]
    MalformedType {
        /// The offending type tag.
        type_tag: String,
    },

    /// The envelope could not be serialized for the wire.
    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

/// Durable publish surface for fact notifications.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one envelope to its event subject.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the envelope cannot be addressed or
    /// the backend rejects the publish. Publish failures before ack are
    /// retried via redelivery.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError>;
}

/// Durable publish surface for command intents.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    /// Routes one command envelope to its work-queue subject.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the envelope cannot be addressed or
    /// the backend rejects the publish.
    async fn route(&self, envelope: &EventEnvelope) -> Result<(), TransportError>;
}

/// Builds the bus subject for an envelope:
/// `<ns>.<tenant>.<workspace>.<agent>.<verb>`.
///
/// The namespace prefix of the type tag is replaced by the scoped form, so
/// `evt.orders.created` in scope `t1/w1` becomes
/// `evt.t1.w1.orders.created`.
///
/// # Errors
///
/// Returns [`TransportError::MalformedType`] when the type tag has no known
/// namespace or no agent/verb segments.
pub fn subject_for(envelope: &EventEnvelope) -> Result<String, TransportError> {
    let namespace =
        TypeNamespace::parse(&envelope.event_type).map_err(|_| TransportError::MalformedType {
            type_tag: envelope.event_type.clone(),
        })?;
    let rest = envelope
        .event_type
        .splitn(2, '.')
        .nth(1)
        .filter(|rest| rest.contains('.'))
        .ok_or_else(|| TransportError::MalformedType {
            type_tag: envelope.event_type.clone(),
        })?;
    Ok(format!(
        "{}.{}.{}.{rest}",
        namespace.prefix(),
        envelope.tenant,
        envelope.workspace
    ))
}

/// Builds the dead-letter subject for an original subject.
#[must_use]
pub fn dlq_subject(original: &str) -> String {
    format!("failed.{original}")
}
