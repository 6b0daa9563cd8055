//! JetStream command router.

use async_nats::jetstream;
use async_trait::async_trait;
use tessera_core::determinism::to_canonical_json;
use tessera_core::envelope::EventEnvelope;
use tessera_core::transport::{subject_for, CommandRouter, TransportError};
use tracing::{debug, warn};

/// Publishes command intents onto the durable work-queue stream.
#[derive(Clone)]
pub struct JetStreamCommandRouter {
    context: jetstream::Context,
}

impl JetStreamCommandRouter {
    /// Creates a router over an already-connected JetStream context.
    #[must_use]
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl CommandRouter for JetStreamCommandRouter {
    async fn route(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if !envelope.is_command() {
            warn!(type_tag = %envelope.event_type, "refusing to route non-command");
            return Ok(());
        }
        let subject = subject_for(envelope)?;
        let payload =
            to_canonical_json(envelope).map_err(|e| TransportError::Serialization(e.to_string()))?;

        let ack = self
            .context
            .publish(subject.clone(), payload.into_bytes().into())
            .await
            .map_err(|e| TransportError::Route {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;
        let ack = ack.await.map_err(|e| TransportError::Route {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;
        debug!(subject = %subject, seq = ack.sequence, message_id = %envelope.message_id, "routed");
        Ok(())
    }
}
