//! Defines the trait for the work a job stands for.

use crate::error::TaskError;
use crate::job::Job;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// The task executed for each delivered job, e.g. sending a registration email.
///
/// The worker treats it as opaque: `Ok` acknowledges the job, `Err` feeds the
/// retry state machine. It runs to completion; there is no timeout.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The job payload. Must be deserializable from the JSON message body.
    type Payload: DeserializeOwned + Send + Sync;

    /// Executes one attempt of `job`. `job.retries` is the number of earlier
    /// failed attempts.
    async fn process(&self, job: &Job<Self::Payload>) -> Result<(), TaskError>;

    /// A name for the handler, used for logging.
    fn handler_name(&self) -> &str;
}
