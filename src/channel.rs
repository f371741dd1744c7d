//! Broker operations used by the topology initializer, producer and worker,
//! and their `lapin` implementations.

use crate::error::{QueueError, Result};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};

/// AMQP delivery mode marking a message persistent.
pub const PERSISTENT: u8 = 2;

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    /// Queue that receives messages rejected or expired by the broker.
    pub dead_letter_queue: Option<String>,
}

impl QueueDeclaration {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_queue: None,
        }
    }

    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// Declaration arguments, routing dead letters through the default exchange.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ref dlq) = self.dead_letter_queue {
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dlq.as_str().into()),
            );
        }
        args
    }
}

/// Why a message was sent to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    Undecodable,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRetriesExceeded => "max-retries-exceeded",
            DeadLetterReason::Undecodable => "undecodable",
        }
    }
}

/// Metadata attached to a published message as AMQP headers.
///
/// Informational only: the job body stays the source of truth for `retries`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMeta {
    pub retry_count: u32,
    pub last_exception: Option<String>,
    pub dead_letter_reason: Option<DeadLetterReason>,
}

impl PublishMeta {
    /// Metadata for a job republished after a failed attempt.
    pub fn retry(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            retry_count,
            last_exception: Some(error.into()),
            dead_letter_reason: None,
        }
    }

    /// Metadata for a message headed to the dead-letter queue.
    pub fn dead_letter(
        retry_count: u32,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            retry_count,
            last_exception: Some(error.into()),
            dead_letter_reason: Some(reason),
        }
    }

    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert("x-retry-count".into(), AMQPValue::LongLongInt(self.retry_count as i64));

        if let Some(ref exception) = self.last_exception {
            headers.insert(
                "x-last-exception".into(),
                AMQPValue::LongString(exception.as_str().into()),
            );
        }

        let now = Utc::now().to_rfc3339();
        match self.dead_letter_reason {
            Some(reason) => {
                headers.insert(
                    "x-dlq-reason".into(),
                    AMQPValue::LongString(reason.as_str().into()),
                );
                headers.insert("x-dead-lettered-at".into(), AMQPValue::LongString(now.into()));
            }
            None if self.retry_count > 0 => {
                headers.insert("x-last-retry-time".into(), AMQPValue::LongString(now.into()));
            }
            None => {}
        }
        headers
    }
}

/// The broker operations the queue subsystem needs from one channel.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Declares a queue. Re-declaring with identical parameters is a no-op;
    /// conflicting parameters yield [`QueueError::Configuration`].
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<()>;

    /// Publishes `body` as a persistent message to `queue` and returns once
    /// the broker has accepted it.
    async fn publish(&self, queue: &str, body: &[u8], meta: &PublishMeta) -> Result<()>;
}

/// Settlement of one delivered message.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Positive acknowledgement; the broker forgets the message.
    async fn acknowledge(&self) -> Result<()>;

    /// Hands the message back to the broker, which puts it back on its queue
    /// for redelivery.
    async fn requeue(&self) -> Result<()>;
}

fn ensure_open(channel: &Channel) -> Result<()> {
    if channel.status().connected() {
        Ok(())
    } else {
        Err(QueueError::ChannelClosed {
            state: format!("{:?}", channel.status().state()),
        })
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

#[async_trait]
impl QueueChannel for Channel {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<()> {
        ensure_open(self)?;

        self.queue_declare(
            &declaration.name,
            QueueDeclareOptions { durable: declaration.durable, ..Default::default() },
            declaration.arguments(),
        )
        .await
        .map_err(|e| {
            if is_precondition_failed(&e) {
                QueueError::configuration(format!(
                    "queue '{}' already exists with different settings: {}",
                    declaration.name, e
                ))
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], meta: &PublishMeta) -> Result<()> {
        ensure_open(self)?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_headers(meta.headers());

        let publish_error = |reason: String| QueueError::Publish {
            queue: queue.to_string(),
            reason,
        };

        // Empty exchange name routes straight to the queue named by the routing key.
        let confirmation = self
            .basic_publish(
                "",
                queue,
                BasicPublishOptions { mandatory: true, ..Default::default() },
                body,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        match confirmation {
            Confirmation::Nack(_) => {
                Err(publish_error("broker negatively acknowledged the message".into()))
            }
            Confirmation::Ack(Some(_)) => {
                Err(publish_error("message returned as unroutable".into()))
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }
}

#[async_trait]
impl Acknowledge for Delivery {
    async fn acknowledge(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Acknowledge { reason: e.to_string() })
    }

    async fn requeue(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions { requeue: true, ..Default::default() })
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Acknowledge { reason: e.to_string() })
    }
}
