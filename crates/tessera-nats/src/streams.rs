//! Stream provisioning.

use async_nats::jetstream;
use tracing::info;

use crate::NatsTransportError;

/// Default name of the durable event stream.
pub const EVENTS_STREAM: &str = "TESSERA_EVENTS";

/// Default name of the durable command stream.
pub const COMMANDS_STREAM: &str = "TESSERA_COMMANDS";

/// Idempotently creates the event stream: `evt.>`, file storage, limits
/// retention.
///
/// # Errors
///
/// Returns [`NatsTransportError::JetStream`] when provisioning fails.
pub async fn ensure_events_stream(
    context: &jetstream::Context,
    name: &str,
) -> Result<jetstream::stream::Stream, NatsTransportError> {
    let stream = context
        .get_or_create_stream(jetstream::stream::Config {
            name: name.to_string(),
            subjects: vec!["evt.>".to_string()],
            retention: jetstream::stream::RetentionPolicy::Limits,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| NatsTransportError::JetStream(e.to_string()))?;
    info!(stream = %name, "event stream ensured");
    Ok(stream)
}

/// Idempotently creates the command stream: `cmd.>`, file storage,
/// work-queue retention so each command is drained by exactly one consumer.
///
/// # Errors
///
/// Returns [`NatsTransportError::JetStream`] when provisioning fails.
pub async fn ensure_commands_stream(
    context: &jetstream::Context,
    name: &str,
) -> Result<jetstream::stream::Stream, NatsTransportError> {
    let stream = context
        .get_or_create_stream(jetstream::stream::Config {
            name: name.to_string(),
            subjects: vec!["cmd.>".to_string()],
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| NatsTransportError::JetStream(e.to_string()))?;
    info!(stream = %name, "command stream ensured");
    Ok(stream)
}
