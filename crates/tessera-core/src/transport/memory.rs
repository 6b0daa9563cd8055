//! In-memory transport implementations.
//!
//! `MemoryBus` captures published events for introspection,
//! `MemoryWorkQueue` provides durable-queue semantics (delivery counting,
//! backoff, dead-letter escape) inside one process, and `InProcessRouter`
//! routes commands onto the work queues of locally hosted agents.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{dlq_subject, subject_for, CommandRouter, EventBus, TransportError};
use crate::envelope::EventEnvelope;

/// Event bus that records every publish, for local development and tests.
#[derive(Debug, Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(String, EventEnvelope)>>,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, as `(subject, envelope)` in publish
    /// order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().expect("bus mutex poisoned").clone()
    }

    /// Envelopes published so far, in publish order.
    #[must_use]
    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .expect("bus mutex poisoned")
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Drops all recorded publishes.
    pub fn clear(&self) {
        self.published.lock().expect("bus mutex poisoned").clear();
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let subject = subject_for(envelope)?;
        debug!(subject = %subject, message_id = %envelope.message_id, "memory bus publish");
        self.published
            .lock()
            .expect("bus mutex poisoned")
            .push((subject, envelope.clone()));
        Ok(())
    }
}

/// One delivery handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Identifier used to ack/nak this delivery.
    pub delivery_id: u64,
    /// Subject the message was addressed to.
    pub subject: String,
    /// The delivered envelope.
    pub envelope: EventEnvelope,
    /// How many times this message has been delivered (1-based).
    pub deliveries: u32,
}

#[derive(Debug)]
struct Queued {
    id: u64,
    subject: String,
    envelope: EventEnvelope,
    deliveries: u32,
    not_before: Instant,
}

#[derive(Debug, Default)]
struct QueueInner {
    next_id: u64,
    pending: VecDeque<Queued>,
    in_flight: HashMap<u64, Queued>,
    dead_letters: Vec<(String, EventEnvelope)>,
}

/// Work queue with at-least-once semantics.
///
/// Messages stay in flight until acked; a nak re-enqueues the message with
/// the next step of the backoff schedule. Dead-lettering moves the message
/// to an inspectable DLQ under `failed.<subject>`.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    inner: Mutex<QueueInner>,
    backoff: Vec<Duration>,
}

impl MemoryWorkQueue {
    /// Creates a queue with a redelivery backoff schedule in milliseconds.
    #[must_use]
    pub fn new(backoff_schedule_ms: &[u64]) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            backoff: backoff_schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    /// Enqueues a message for delivery.
    pub fn push(&self, subject: impl Into<String>, envelope: EventEnvelope) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.push_back(Queued {
            id,
            subject: subject.into(),
            envelope,
            deliveries: 0,
            not_before: Instant::now(),
        });
    }

    /// Pulls the next eligible message, if any.
    #[must_use]
    pub fn try_pull(&self) -> Option<Delivery> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let now = Instant::now();
        let position = inner.pending.iter().position(|m| m.not_before <= now)?;
        let mut message = inner.pending.remove(position)?;
        message.deliveries += 1;
        let delivery = Delivery {
            delivery_id: message.id,
            subject: message.subject.clone(),
            envelope: message.envelope.clone(),
            deliveries: message.deliveries,
        };
        inner.in_flight.insert(message.id, message);
        Some(delivery)
    }

    /// Waits for the next eligible message.
    pub async fn pull(&self) -> Delivery {
        loop {
            if let Some(delivery) = self.try_pull() {
                return delivery;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Acknowledges a delivery, removing the message permanently.
    pub fn ack(&self, delivery_id: u64) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.in_flight.remove(&delivery_id);
    }

    /// Negatively acknowledges a delivery; the message is re-enqueued after
    /// the backoff step for its delivery count.
    pub fn nak(&self, delivery_id: u64) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(mut message) = inner.in_flight.remove(&delivery_id) {
            let step = (message.deliveries as usize)
                .saturating_sub(1)
                .min(self.backoff.len().saturating_sub(1));
            let delay = self.backoff.get(step).copied().unwrap_or(Duration::ZERO);
            message.not_before = Instant::now() + delay;
            inner.pending.push_back(message);
        }
    }

    /// Moves an in-flight message to the dead-letter queue and acknowledges
    /// it.
    pub fn dead_letter(&self, delivery_id: u64) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(message) = inner.in_flight.remove(&delivery_id) {
            let subject = dlq_subject(&message.subject);
            inner.dead_letters.push((subject, message.envelope));
        }
    }

    /// Dead letters accumulated so far, as `(failed-subject, envelope)`.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(String, EventEnvelope)> {
        self.inner
            .lock()
            .expect("queue mutex poisoned")
            .dead_letters
            .clone()
    }

    /// Whether no message is pending or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        inner.pending.is_empty() && inner.in_flight.is_empty()
    }
}

/// Routes commands onto the work queues of agents hosted in this process.
///
/// Registration follows the subject grammar: a command `cmd.<agent>.<verb>`
/// lands on the queue registered for `<agent>`. Commands for unknown agents
/// are dropped with a warning, matching a work-queue stream with no
/// consumer.
#[derive(Debug, Default)]
pub struct InProcessRouter {
    queues: Mutex<HashMap<String, Arc<MemoryWorkQueue>>>,
}

impl InProcessRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the work queue draining commands for `agent`.
    pub fn register(&self, agent: impl Into<String>, queue: Arc<MemoryWorkQueue>) {
        self.queues
            .lock()
            .expect("router mutex poisoned")
            .insert(agent.into(), queue);
    }
}

#[async_trait]
impl CommandRouter for InProcessRouter {
    async fn route(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if !envelope.is_command() {
            warn!(type_tag = %envelope.event_type, "refusing to route non-command");
            return Ok(());
        }
        let subject = subject_for(envelope)?;
        let target = envelope
            .target_agent()
            .ok_or_else(|| TransportError::MalformedType {
                type_tag: envelope.event_type.clone(),
            })?;
        let queue = self
            .queues
            .lock()
            .expect("router mutex poisoned")
            .get(target)
            .cloned();
        match queue {
            Some(queue) => {
                debug!(subject = %subject, target = %target, "routing command");
                queue.push(subject, envelope.clone());
            }
            None => warn!(subject = %subject, target = %target, "no route for agent"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::adapter::testing::command;

    #[tokio::test]
    async fn bus_records_publishes_in_order() {
        let bus = MemoryBus::new();
        let mut first = command("t1", "w1", "orders", "create", "k1", Map::new());
        first.event_type = "evt.orders.created".to_string();
        let mut second = command("t1", "w1", "orders", "create", "k2", Map::new());
        second.event_type = "evt.orders.updated".to_string();
        bus.publish(&first).await.unwrap();
        bus.publish(&second).await.unwrap();
        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "evt.t1.w1.orders.created");
        assert_eq!(published[1].0, "evt.t1.w1.orders.updated");
    }

    #[tokio::test]
    async fn queue_counts_deliveries_across_naks() {
        let queue = MemoryWorkQueue::new(&[0]);
        queue.push("cmd.t1.w1.orders.create", command("t1", "w1", "orders", "create", "k1", Map::new()));

        let first = queue.try_pull().expect("first delivery");
        assert_eq!(first.deliveries, 1);
        queue.nak(first.delivery_id);

        let second = queue.try_pull().expect("second delivery");
        assert_eq!(second.deliveries, 2);
        queue.ack(second.delivery_id);
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn nak_applies_progressive_backoff() {
        let queue = MemoryWorkQueue::new(&[1_000, 5_000]);
        queue.push("cmd.t1.w1.orders.create", command("t1", "w1", "orders", "create", "k1", Map::new()));

        let first = queue.pull().await;
        queue.nak(first.delivery_id);
        assert!(queue.try_pull().is_none(), "backoff not yet elapsed");

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let second = queue.try_pull().expect("eligible after first backoff step");
        queue.nak(second.delivery_id);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(queue.try_pull().is_none(), "second step is longer");
        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert!(queue.try_pull().is_some());
    }

    #[tokio::test]
    async fn dead_letter_moves_message_to_failed_subject() {
        let queue = MemoryWorkQueue::new(&[0]);
        queue.push("cmd.t1.w1.orders.create", command("t1", "w1", "orders", "create", "k1", Map::new()));
        let delivery = queue.try_pull().expect("delivery");
        queue.dead_letter(delivery.delivery_id);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "failed.cmd.t1.w1.orders.create");
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn router_routes_to_registered_agent_only() {
        let router = InProcessRouter::new();
        let queue = Arc::new(MemoryWorkQueue::new(&[0]));
        router.register("orders", Arc::clone(&queue));

        router
            .route(&command("t1", "w1", "orders", "create", "k1", Map::new()))
            .await
            .unwrap();
        router
            .route(&command("t1", "w1", "billing", "charge", "k2", Map::new()))
            .await
            .unwrap();

        assert!(queue.try_pull().is_some());
        assert!(queue.try_pull().is_none());
    }
}
