//! JetStream event bus.

use async_nats::jetstream;
use async_trait::async_trait;
use tessera_core::determinism::to_canonical_json;
use tessera_core::envelope::EventEnvelope;
use tessera_core::transport::{subject_for, EventBus, TransportError};
use tracing::debug;

/// Publishes fact notifications onto the durable event stream.
///
/// Subjects follow `evt.<tenant>.<workspace>.<agent>.<verb>`; payloads are
/// the envelope's canonical JSON, so republished duplicates are byte-equal
/// to the originals.
#[derive(Clone)]
pub struct JetStreamEventBus {
    context: jetstream::Context,
}

impl JetStreamEventBus {
    /// Creates a bus over an already-connected JetStream context.
    #[must_use]
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventBus for JetStreamEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let subject = subject_for(envelope)?;
        let payload =
            to_canonical_json(envelope).map_err(|e| TransportError::Serialization(e.to_string()))?;

        let ack = self
            .context
            .publish(subject.clone(), payload.into_bytes().into())
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;
        // The server acknowledges durable placement; only then is the
        // publish considered complete.
        let ack = ack.await.map_err(|e| TransportError::Publish {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;
        debug!(subject = %subject, seq = ack.sequence, message_id = %envelope.message_id, "published");
        Ok(())
    }
}
