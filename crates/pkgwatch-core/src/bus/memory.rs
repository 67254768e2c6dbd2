//! In-process message bus

use super::{Delivery, MessageBus, Metadata};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// How often a waiting receiver re-checks for expired leases
const LEASE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: Vec<u8>,
    metadata: Metadata,
    attempt: u32,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    leased: HashMap<String, (Stored, Instant)>,
}

impl Queue {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((msg, _)) = self.leased.remove(&receipt) {
                debug!("Lease expired for message {}, redelivering", msg.id);
                self.ready.push_back(msg);
            }
        }
    }
}

/// Message bus living in process memory
pub struct MemoryBus {
    queues: Mutex<HashMap<String, Queue>>,
    notify: Notify,
    ack_deadline: Duration,
}

impl MemoryBus {
    pub fn new(ack_deadline: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            ack_deadline,
        }
    }

    /// Messages waiting to be received on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        self.with_queues(|queues| queues.get(topic).map(|q| q.ready.len()).unwrap_or(0))
    }

    /// Messages received but not yet acknowledged on `topic`
    pub fn in_flight(&self, topic: &str) -> usize {
        self.with_queues(|queues| queues.get(topic).map(|q| q.leased.len()).unwrap_or(0))
    }

    fn with_queues<T>(&self, f: impl FnOnce(&mut HashMap<String, Queue>) -> T) -> T {
        let mut guard = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn try_receive(&self, subscription: &str) -> Option<Delivery> {
        let ack_deadline = self.ack_deadline;
        self.with_queues(|queues| {
            let queue = queues.entry(subscription.to_string()).or_default();
            let now = Instant::now();
            queue.requeue_expired(now);

            let mut msg = queue.ready.pop_front()?;
            msg.attempt += 1;
            let receipt = uuid::Uuid::new_v4().to_string();
            queue
                .leased
                .insert(receipt.clone(), (msg.clone(), now + ack_deadline));

            Some(Delivery {
                id: msg.id,
                body: msg.body,
                metadata: msg.metadata,
                attempt: msg.attempt,
                receipt,
                subscription: subscription.to_string(),
            })
        })
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, body: Vec<u8>, metadata: Metadata) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.with_queues(|queues| {
            queues
                .entry(topic.to_string())
                .or_default()
                .ready
                .push_back(Stored {
                    id: id.clone(),
                    body,
                    metadata,
                    attempt: 0,
                });
        });
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, subscription: &str) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_receive(subscription) {
                return Ok(delivery);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(LEASE_CHECK_INTERVAL.min(self.ack_deadline)) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let removed = self.with_queues(|queues| {
            queues
                .get_mut(&delivery.subscription)
                .and_then(|q| q.leased.remove(&delivery.receipt))
                .is_some()
        });
        if !removed {
            debug!("Ack for message {} arrived after its lease expired", delivery.id);
        }
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery, extension: Duration) -> Result<()> {
        let extended = self.with_queues(|queues| {
            let Some(queue) = queues.get_mut(&delivery.subscription) else {
                return false;
            };
            let now = Instant::now();
            queue.requeue_expired(now);
            match queue.leased.get_mut(&delivery.receipt) {
                Some((_, deadline)) => {
                    *deadline = now + extension;
                    true
                }
                None => false,
            }
        });
        if !extended {
            return Err(PipelineError::Bus(format!(
                "Lease on message {} has already expired",
                delivery.id
            )));
        }
        debug!("Extended lease on message {} by {:?}", delivery.id, extension);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("name".into(), name.into());
        m
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let bus = MemoryBus::new(Duration::from_secs(60));
        let id = bus.publish("jobs", b"{}".to_vec(), meta("a")).await.unwrap();

        let delivery = bus.receive("jobs").await.unwrap();
        assert_eq!(delivery.id, id);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.attribute("name"), Some("a"));
        assert_eq!(bus.in_flight("jobs"), 1);

        bus.ack(&delivery).await.unwrap();
        assert_eq!(bus.in_flight("jobs"), 0);
        assert_eq!(bus.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let bus = MemoryBus::new(Duration::from_millis(50));
        bus.publish("jobs", b"x".to_vec(), Metadata::new()).await.unwrap();

        let first = bus.receive("jobs").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), bus.receive("jobs"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 2);

        // Stale ack is accepted and does not disturb the live lease
        bus.ack(&first).await.unwrap();
        assert_eq!(bus.in_flight("jobs"), 1);
        bus.ack(&second).await.unwrap();
        assert_eq!(bus.in_flight("jobs"), 0);
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let bus = std::sync::Arc::new(MemoryBus::new(Duration::from_secs(60)));
        let receiver = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive("jobs").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("jobs", b"late".to_vec(), Metadata::new()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_extended_lease_is_not_redelivered() {
        let bus = MemoryBus::new(Duration::from_millis(50));
        bus.publish("jobs", b"x".to_vec(), Metadata::new()).await.unwrap();

        let delivery = bus.receive("jobs").await.unwrap();
        bus.extend_lease(&delivery, Duration::from_secs(60)).await.unwrap();

        let again = tokio::time::timeout(Duration::from_millis(300), bus.receive("jobs")).await;
        assert!(again.is_err());
        assert_eq!(bus.in_flight("jobs"), 1);
    }

    #[tokio::test]
    async fn test_extending_an_expired_lease_fails() {
        let bus = MemoryBus::new(Duration::from_millis(0));
        bus.publish("jobs", b"x".to_vec(), Metadata::new()).await.unwrap();

        let delivery = bus.receive("jobs").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bus.extend_lease(&delivery, Duration::from_secs(60)).await.is_err());
        assert_eq!(bus.pending("jobs"), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryBus::new(Duration::from_secs(60));
        bus.publish("a", b"1".to_vec(), Metadata::new()).await.unwrap();
        assert_eq!(bus.pending("a"), 1);
        assert_eq!(bus.pending("b"), 0);
    }
}
