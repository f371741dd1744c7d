//! Declaration of the main queue and its dead-letter queue.

use crate::channel::{QueueChannel, QueueDeclaration};
use crate::error::{QueueError, Result};

/// The two queues of the subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub main_queue: String,
    pub dead_letter_queue: String,
}

impl QueueTopology {
    pub fn new(main_queue: impl Into<String>, dead_letter_queue: impl Into<String>) -> Self {
        Self {
            main_queue: main_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
        }
    }

    pub fn dead_letter_declaration(&self) -> QueueDeclaration {
        QueueDeclaration::durable(&self.dead_letter_queue)
    }

    pub fn main_declaration(&self) -> QueueDeclaration {
        QueueDeclaration::durable(&self.main_queue).dead_letter_to(&self.dead_letter_queue)
    }

    /// Declares the DLQ, then the main queue dead-lettering into it.
    ///
    /// Safe to run repeatedly with the same names. A declaration conflicting
    /// with what the broker already holds fails with
    /// [`QueueError::Configuration`]; with RabbitMQ that also closes the channel.
    pub async fn setup<C: QueueChannel + ?Sized>(&self, channel: &C) -> Result<()> {
        if self.main_queue.is_empty() || self.dead_letter_queue.is_empty() {
            return Err(QueueError::configuration("queue names must not be empty"));
        }
        if self.main_queue == self.dead_letter_queue {
            return Err(QueueError::configuration(format!(
                "main queue and dead-letter queue must differ (both '{}')",
                self.main_queue
            )));
        }

        channel.declare_queue(&self.dead_letter_declaration()).await?;
        channel.declare_queue(&self.main_declaration()).await?;

        log::info!(
            "Queues set up: '{}' dead-letters into '{}'",
            self.main_queue,
            self.dead_letter_queue
        );
        Ok(())
    }
}
