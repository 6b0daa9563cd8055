//! Pull-consumer loop for the in-memory work queue.
//!
//! One consumer instance drains one engine's command queue: each delivery
//! is handed to the engine, acknowledged only when the engine reaches a
//! terminal disposition, and negatively acknowledged (with the queue's
//! backoff schedule) on transient failure. A message that keeps failing is
//! republished to `failed.<subject>` and acknowledged after `max_deliver`
//! attempts, and the consumer moves on; one poison pill never wedges the
//! stream.
//!
//! The JetStream consumer in the companion transport crate implements the
//! same protocol against a broker.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::engine::RuntimeEngine;
use crate::telemetry::{Metric, MetricsSink, NoopMetrics};
use crate::transport::memory::MemoryWorkQueue;

/// Consumer tuning shared by the in-memory and JetStream consumers.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries before a message is dead-lettered.
    pub max_deliver: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { max_deliver: 5 }
    }
}

/// Handle to a running [`MemoryConsumer`] loop.
///
/// Dropping the handle does not stop the loop; call
/// [`shutdown`](ConsumerHandle::shutdown) to drain.
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stops the consumer and waits for the in-flight message to reach a
    /// terminal state.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }
}

/// Pull consumer binding a [`MemoryWorkQueue`] to a [`RuntimeEngine`].
pub struct MemoryConsumer {
    queue: Arc<MemoryWorkQueue>,
    engine: Arc<RuntimeEngine>,
    config: ConsumerConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl MemoryConsumer {
    /// Creates a consumer for a queue/engine pair.
    #[must_use]
    pub fn new(
        queue: Arc<MemoryWorkQueue>,
        engine: Arc<RuntimeEngine>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            config,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Replaces the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawns the consume loop and returns its handle.
    #[must_use]
    pub fn spawn(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        ConsumerHandle {
            stop: stop_tx,
            join,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let delivery = tokio::select! {
                delivery = self.queue.pull() => delivery,
                _ = stop.changed() => break,
            };

            match self.engine.process(delivery.envelope.clone()).await {
                Ok(outcome) => {
                    debug!(
                        subject = %delivery.subject,
                        duplicate = outcome.is_duplicate(),
                        "processed, acking"
                    );
                    self.queue.ack(delivery.delivery_id);
                }
                Err(err) => {
                    if delivery.deliveries >= self.config.max_deliver {
                        error!(
                            subject = %delivery.subject,
                            deliveries = delivery.deliveries,
                            error = %err,
                            "max deliveries exceeded, moving message to dead letter queue"
                        );
                        self.queue.dead_letter(delivery.delivery_id);
                        self.metrics.incr(Metric::DeadLetters, 1);
                    } else {
                        warn!(
                            subject = %delivery.subject,
                            deliveries = delivery.deliveries,
                            error = %err,
                            "transient failure, nacking for redelivery"
                        );
                        self.queue.nak(delivery.delivery_id);
                    }
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    }
}
