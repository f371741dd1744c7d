//! Enqueues new jobs on the main queue.

use crate::channel::{PublishMeta, QueueChannel};
use crate::error::{QueueError, Result};
use crate::job::Job;
use lapin::Channel;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Publishes jobs to the main queue.
///
/// The producer can be created before the broker is reachable and receive its
/// channel later through [`Producer::attach`]; until then every `enqueue`
/// fails with [`QueueError::ChannelNotInitialized`].
pub struct Producer<C = Channel> {
    queue: String,
    channel: RwLock<Option<Arc<C>>>,
}

impl<C: QueueChannel> Producer<C> {
    /// Creates a producer with no channel attached.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            channel: RwLock::new(None),
        }
    }

    pub fn with_channel(queue: impl Into<String>, channel: Arc<C>) -> Self {
        let producer = Self::new(queue);
        producer.attach(channel);
        producer
    }

    /// Attaches (or replaces, after a reconnect) the channel used for publishing.
    pub fn attach(&self, channel: Arc<C>) {
        *self.channel.write().unwrap_or_else(|e| e.into_inner()) = Some(channel);
    }

    /// Detaches the current channel, returning it.
    pub fn detach(&self) -> Option<Arc<C>> {
        self.channel.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_ready(&self) -> bool {
        self.channel.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn channel(&self) -> Result<Arc<C>> {
        self.channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(QueueError::ChannelNotInitialized)
    }

    /// Wraps `payload` in a job with `retries = 0` and publishes it as a
    /// persistent message.
    ///
    /// Returns once the broker has accepted the message. Failures are logged
    /// and returned without retrying; the caller should treat the job as not
    /// queued.
    pub async fn enqueue<P: Serialize + Send>(&self, payload: P) -> Result<()> {
        let result = self.try_enqueue(payload).await;
        if let Err(ref e) = result {
            log::error!("Failed to send message to queue '{}': {}", self.queue, e);
        }
        result
    }

    async fn try_enqueue<P: Serialize + Send>(&self, payload: P) -> Result<()> {
        let channel = self.channel()?;
        let body = Job::new(payload).encode()?;

        channel.publish(&self.queue, &body, &PublishMeta::default()).await?;

        log::info!(
            "Message sent to queue '{}': {}",
            self.queue,
            String::from_utf8_lossy(&body)
        );
        Ok(())
    }
}
