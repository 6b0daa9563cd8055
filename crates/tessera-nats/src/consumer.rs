//! Durable JetStream pull consumer.
//!
//! One consumer instance feeds one engine: durable name
//! `<agent>_consumer`, filter subject on the agent's command prefix,
//! explicit acknowledgement, and server-side progressive backoff between
//! redeliveries. The engine's terminal dispositions are acknowledged; its
//! transient errors are negatively acknowledged so the server redelivers.
//! When the delivery count reaches the limit the payload is republished to
//! `failed.<original_subject>`, the original is acknowledged, and a
//! critical event is logged. The stream keeps moving past poison pills.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::AckKind;
use futures::StreamExt;
use tessera_core::transport::dlq_subject;
use tessera_core::{RuntimeConfig, RuntimeEngine};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::NatsTransportError;

/// Durable consumer settings.
#[derive(Debug, Clone)]
pub struct JetStreamConsumerConfig {
    /// Stream the consumer pulls from.
    pub stream: String,
    /// Durable consumer name.
    pub durable_name: String,
    /// Subject filter, normally the engine's command prefix.
    pub filter_subject: String,
    /// Deliveries before the dead-letter escape.
    pub max_deliver: i64,
    /// Server-side backoff schedule between redeliveries.
    pub backoff: Vec<Duration>,
    /// How long the server waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl JetStreamConsumerConfig {
    /// Derives the consumer settings for an engine from its runtime
    /// configuration: durable `<agent>_consumer`, filter
    /// `cmd.<tenant>.<workspace>.<agent>.>`.
    #[must_use]
    pub fn for_engine(runtime: &RuntimeConfig, stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            durable_name: format!("{}_consumer", runtime.agent_id),
            filter_subject: format!(
                "cmd.{}.{}.{}.>",
                runtime.tenant, runtime.workspace, runtime.agent_id
            ),
            max_deliver: i64::from(runtime.max_deliver),
            backoff: runtime
                .backoff_schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            ack_wait: Duration::from_millis(runtime.ack_wait_ms),
        }
    }
}

/// Handle to a running consumer loop.
pub struct ConsumerTask {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerTask {
    /// Stops the loop and waits for the in-flight message to reach a
    /// terminal state.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }
}

/// Durable pull consumer binding a JetStream stream to an engine.
pub struct JetStreamConsumer {
    context: jetstream::Context,
    engine: Arc<RuntimeEngine>,
    config: JetStreamConsumerConfig,
}

impl JetStreamConsumer {
    /// Creates a consumer; call [`start`](Self::start) to begin pulling.
    #[must_use]
    pub fn new(
        context: jetstream::Context,
        engine: Arc<RuntimeEngine>,
        config: JetStreamConsumerConfig,
    ) -> Self {
        Self {
            context,
            engine,
            config,
        }
    }

    /// Ensures the durable consumer exists and spawns the pull loop.
    ///
    /// The engine's `replay` must have completed before this is called.
    ///
    /// # Errors
    ///
    /// Returns [`NatsTransportError::JetStream`] when the stream or
    /// consumer cannot be provisioned.
    pub async fn start(self) -> Result<ConsumerTask, NatsTransportError> {
        let stream = self
            .context
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| NatsTransportError::JetStream(e.to_string()))?;

        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some(self.config.durable_name.clone()),
                filter_subject: self.config.filter_subject.clone(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                max_deliver: self.config.max_deliver,
                backoff: self.config.backoff.clone(),
                ack_wait: self.config.ack_wait,
                ..Default::default()
            })
            .await
            .map_err(|e| NatsTransportError::JetStream(e.to_string()))?;
        info!(
            durable = %self.config.durable_name,
            stream = %self.config.stream,
            filter = %self.config.filter_subject,
            "consumer ensured"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(consumer, stop_rx));
        Ok(ConsumerTask {
            stop: stop_tx,
            join,
        })
    }

    async fn run(self, consumer: jetstream::consumer::Consumer<pull::Config>, mut stop: watch::Receiver<bool>) {
        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(err) => {
                error!(error = %err, "failed to open message stream");
                return;
            }
        };

        loop {
            let message = tokio::select! {
                message = messages.next() => message,
                _ = stop.changed() => break,
            };
            let Some(message) = message else { break };
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "message stream error");
                    continue;
                }
            };

            self.handle_message(message).await;

            if *stop.borrow() {
                break;
            }
        }
    }

    async fn handle_message(&self, message: jetstream::Message) {
        let delivered = message.info().map(|info| info.delivered).unwrap_or(1);

        let envelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Undeserializable payloads cannot reach the engine's
                // contract handling; they ride the redelivery path to the
                // dead-letter queue.
                warn!(subject = %message.subject, error = %err, "undecodable payload");
                self.reject(message, delivered).await;
                return;
            }
        };

        match self.engine.process(envelope).await {
            Ok(outcome) => {
                debug!(
                    subject = %message.subject,
                    duplicate = outcome.is_duplicate(),
                    "processed, acking"
                );
                if let Err(err) = message.double_ack().await {
                    // Ack loss means a redelivery; the dedup hit absorbs it.
                    warn!(subject = %message.subject, error = %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(
                    subject = %message.subject,
                    delivered,
                    error = %err,
                    "transient failure"
                );
                self.reject(message, delivered).await;
            }
        }
    }

    /// Nak for redelivery, or move to the DLQ once the delivery count
    /// reaches the limit.
    async fn reject(&self, message: jetstream::Message, delivered: i64) {
        if delivered >= self.config.max_deliver {
            let failed_subject = dlq_subject(message.subject.as_str());
            error!(
                subject = %message.subject,
                dlq = %failed_subject,
                delivered,
                "max deliveries exceeded, moving message to dead letter queue"
            );
            match self
                .context
                .publish(failed_subject.clone(), message.payload.clone())
                .await
            {
                Ok(ack) => {
                    if let Err(err) = ack.await {
                        error!(dlq = %failed_subject, error = %err, "dead letter publish unacked");
                        let _ = message.ack_with(AckKind::Nak(None)).await;
                        return;
                    }
                }
                Err(err) => {
                    error!(dlq = %failed_subject, error = %err, "dead letter publish failed");
                    let _ = message.ack_with(AckKind::Nak(None)).await;
                    return;
                }
            }
            if let Err(err) = message.double_ack().await {
                warn!(subject = %message.subject, error = %err, "ack after dead letter failed");
            }
        } else if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
            warn!(subject = %message.subject, error = %err, "nak failed");
        }
    }
}
