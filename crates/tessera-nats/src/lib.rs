//! NATS JetStream transport adapters for the tessera runtime.
//!
//! Binds the core transport contracts to a JetStream deployment:
//!
//! - [`JetStreamEventBus`]: publishes fact notifications onto the durable
//!   `EVENTS` stream (limits retention).
//! - [`JetStreamCommandRouter`]: publishes command intents onto the durable
//!   `COMMANDS` stream (work-queue retention, one consumer drains each).
//! - [`JetStreamConsumer`]: durable pull consumer feeding an engine, with
//!   explicit acknowledgement, server-side redelivery backoff, and a
//!   client-side `failed.<subject>` dead-letter escape.
//!
//! Envelopes travel as canonical JSON, so a byte-equal envelope publishes
//! byte-equal payloads.

mod bus;
mod consumer;
mod router;
mod streams;

pub use bus::JetStreamEventBus;
pub use consumer::{ConsumerTask, JetStreamConsumer, JetStreamConsumerConfig};
pub use router::JetStreamCommandRouter;
pub use streams::{
    ensure_commands_stream, ensure_events_stream, COMMANDS_STREAM, EVENTS_STREAM,
};

use async_nats::jetstream;
use async_nats::ConnectErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while talking to JetStream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NatsTransportError {
    /// Connecting to the server failed.
    #[error("nats connect error: {0}")]
    Connect(#[from] async_nats::error::Error<ConnectErrorKind>),

    /// Stream or consumer provisioning failed.
    #[error("jetstream error: {0}")]
    JetStream(String),
}

/// Connection settings for the JetStream transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetStreamConfig {
    /// Server URL, e.g. `nats://127.0.0.1:4222`.
    pub url: String,

    /// Durable stream holding `evt.>` subjects.
    #[serde(default = "default_events_stream")]
    pub events_stream: String,

    /// Durable work-queue stream holding `cmd.>` subjects.
    #[serde(default = "default_commands_stream")]
    pub commands_stream: String,
}

fn default_events_stream() -> String {
    EVENTS_STREAM.to_string()
}

fn default_commands_stream() -> String {
    COMMANDS_STREAM.to_string()
}

impl JetStreamConfig {
    /// Config pointing at a server with the default stream names.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events_stream: default_events_stream(),
            commands_stream: default_commands_stream(),
        }
    }
}

/// Connects to the server and provisions both streams idempotently.
///
/// # Errors
///
/// Returns [`NatsTransportError`] when the connection or stream
/// provisioning fails.
pub async fn connect(config: &JetStreamConfig) -> Result<jetstream::Context, NatsTransportError> {
    let client = async_nats::connect(&config.url).await?;
    let context = jetstream::new(client);
    ensure_events_stream(&context, &config.events_stream).await?;
    ensure_commands_stream(&context, &config.commands_stream).await?;
    Ok(context)
}
