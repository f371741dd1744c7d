//! # Reliable Mail Queue
//! A durable RabbitMQ job queue for registration emails: persistent enqueueing,
//! bounded retries by requeueing, and escalation to a dead-letter queue (DLQ).

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod job;
pub mod memory;
pub mod producer;
pub mod retry;
pub mod topology;
pub mod worker;

// Re-export key components for easy access
pub use channel::{Acknowledge, DeadLetterReason, PublishMeta, QueueChannel, QueueDeclaration};
pub use config::QueueSettings;
pub use connection::BrokerConnection;
pub use error::{QueueError, Result, TaskError};
pub use handler::TaskHandler;
pub use job::{Job, RegistrationEmail};
pub use memory::InMemoryBroker;
pub use producer::Producer;
pub use retry::{RetryDecision, RetryPolicy};
pub use topology::QueueTopology;
pub use worker::{Outcome, RetryWorker, WorkerConfig};
