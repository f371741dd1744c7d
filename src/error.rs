use std::fmt;
use thiserror::Error;

/// Result alias used throughout the queue subsystem.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by the connection, topology, producer and worker layers.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error while encoding or decoding a job body.
    #[error("Failed to (de)serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The producer was used before a channel was attached to it.
    #[error("RabbitMQ channel not initialized")]
    ChannelNotInitialized,

    /// The channel is known to be closed or errored and must be replaced.
    #[error("RabbitMQ channel is no longer usable (state: {state})")]
    ChannelClosed { state: String },

    /// Invalid settings, or a queue declaration that conflicts with the broker.
    #[error("Messaging setup or configuration error: {message}")]
    Configuration { message: String },

    /// The broker did not accept a publish.
    #[error("Failed to publish to queue '{queue}': {reason}")]
    Publish { queue: String, reason: String },

    /// The broker did not accept an acknowledgement.
    #[error("Failed to acknowledge delivery: {reason}")]
    Acknowledge { reason: String },
}

impl QueueError {
    pub fn configuration(message: impl Into<String>) -> Self {
        QueueError::Configuration { message: message.into() }
    }
}

/// Failure reported by a [`TaskHandler`](crate::handler::TaskHandler).
///
/// This is the expected trigger for the retry state machine, not a fault of
/// the queue itself.
#[derive(Debug)]
pub struct TaskError(Box<dyn std::error::Error + Send + Sync>);

impl TaskError {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        TaskError(error.into())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<&str> for TaskError {
    fn from(s: &str) -> Self {
        TaskError(s.into())
    }
}

impl From<String> for TaskError {
    fn from(s: String) -> Self {
        TaskError(s.into())
    }
}
