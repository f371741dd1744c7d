//! In-memory broker for tests and local development.
//!
//! Mirrors the RabbitMQ behaviour the subsystem relies on: FIFO queues,
//! declarations that must match on re-declare, publishes to undeclared
//! queues being rejected, and unacknowledged deliveries returning to the
//! head of their queue when requeued or on [`InMemoryBroker::recover`].
//! Publish and ack failures can be scripted.

use crate::channel::{Acknowledge, PublishMeta, QueueChannel, QueueDeclaration};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub meta: PublishMeta,
}

#[derive(Debug, Default)]
struct State {
    declarations: HashMap<String, QueueDeclaration>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_delivery_tag: u64,
    acked: usize,
    publish_failures: usize,
    ack_failures: usize,
    closed: bool,
}

/// Shared handle to an in-memory broker. Clones see the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the queue contents from others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the message at the head of `queue`, leaving it unacknowledged.
    pub fn receive(&self, queue: &str) -> Option<MemoryDelivery> {
        let mut state = self.state();
        let message = state.queues.get_mut(queue)?.pop_front()?;

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        state.unacked.insert(delivery_tag, (queue.to_string(), message.clone()));

        Some(MemoryDelivery {
            delivery_tag,
            body: message.body,
            meta: message.meta,
            broker: self.clone(),
        })
    }

    /// Returns every unacknowledged delivery to the head of its queue, as the
    /// broker does when a consumer's channel goes away.
    pub fn recover(&self) {
        let mut state = self.state();
        let mut pending: Vec<_> = state.unacked.drain().collect();
        // Highest tag first so the oldest delivery ends up at the very front.
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, message)) in pending {
            state.queues.entry(queue).or_default().push_front(message);
        }
    }

    /// Appends a body to `queue` without declaration checks or metadata.
    pub fn publish_raw(&self, queue: &str, body: &[u8]) {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                body: body.to_vec(),
                meta: PublishMeta::default(),
            });
    }

    pub fn declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.state().declarations.get(queue).cloned()
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn acked_count(&self) -> usize {
        self.state().acked
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.state().publish_failures = n;
    }

    /// Makes the next `n` acknowledgements fail.
    pub fn fail_next_acks(&self, n: usize) {
        self.state().ack_failures = n;
    }

    /// Marks the channel dead; every later operation fails.
    pub fn close(&self) {
        self.state().closed = true;
    }

    fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::ChannelClosed { state: "Closed".into() });
        }
        if state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(QueueError::Acknowledge {
                reason: "simulated ack failure".into(),
            });
        }
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(QueueError::Acknowledge {
                reason: format!("unknown delivery tag {}", delivery_tag),
            });
        }
        state.acked += 1;
        Ok(())
    }

    fn requeue(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::ChannelClosed { state: "Closed".into() });
        }
        let (queue, message) = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            QueueError::Acknowledge {
                reason: format!("unknown delivery tag {}", delivery_tag),
            }
        })?;
        state.queues.entry(queue).or_default().push_front(message);
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for InMemoryBroker {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::ChannelClosed { state: "Closed".into() });
        }

        match state.declarations.get(&declaration.name) {
            Some(existing) if existing != declaration => {
                return Err(QueueError::configuration(format!(
                    "queue '{}' already exists with different settings ({:?})",
                    declaration.name, existing
                )));
            }
            Some(_) => {}
            None => {
                state.declarations.insert(declaration.name.clone(), declaration.clone());
            }
        }
        state.queues.entry(declaration.name.clone()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], meta: &PublishMeta) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::ChannelClosed { state: "Closed".into() });
        }
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(QueueError::Publish {
                queue: queue.to_string(),
                reason: "simulated publish failure".into(),
            });
        }
        if !state.declarations.contains_key(queue) {
            return Err(QueueError::Publish {
                queue: queue.to_string(),
                reason: "message returned as unroutable".into(),
            });
        }

        state.queues.entry(queue.to_string()).or_default().push_back(StoredMessage {
            body: body.to_vec(),
            meta: meta.clone(),
        });
        Ok(())
    }
}

/// A message handed out by [`InMemoryBroker::receive`].
#[derive(Debug)]
pub struct MemoryDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub meta: PublishMeta,
    broker: InMemoryBroker,
}

#[async_trait]
impl Acknowledge for MemoryDelivery {
    async fn acknowledge(&self) -> Result<()> {
        self.broker.acknowledge(self.delivery_tag)
    }

    async fn requeue(&self) -> Result<()> {
        self.broker.requeue(self.delivery_tag)
    }
}
