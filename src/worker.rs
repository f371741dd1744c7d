//! The consuming worker and its retry / dead-letter state machine.

use crate::channel::{Acknowledge, DeadLetterReason, PublishMeta, QueueChannel};
use crate::error::{QueueError, Result};
use crate::handler::TaskHandler;
use crate::job::Job;
use crate::memory::InMemoryBroker;
use crate::retry::{RetryDecision, RetryPolicy};
use futures_util::TryStreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;

/// Configuration for a [`RetryWorker`].
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// The main queue to consume from and republish retries to.
    pub queue_name: String,
    /// The queue receiving jobs that exhausted their retries.
    pub dead_letter_queue: String,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// How many times a failing job is retried before dead-lettering.
    pub retry_policy: RetryPolicy,
    /// The number of unacknowledged deliveries the broker may hand out at a
    /// time (QoS prefetch count). Also the number of jobs handled concurrently.
    pub prefetch_count: u16,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The main queue.
    /// * `dead_letter_queue` - The queue for jobs that exhausted their retries.
    pub fn builder(
        queue_name: impl Into<String>,
        dead_letter_queue: impl Into<String>,
    ) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into(), dead_letter_queue.into())
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    dead_letter_queue: String,
    consumer_tag: Option<String>,
    max_retries: Option<u32>,
    prefetch_count: Option<u16>,
}

impl WorkerConfigBuilder {
    fn new(queue_name: String, dead_letter_queue: String) -> Self {
        Self {
            queue_name,
            dead_letter_queue,
            consumer_tag: None,
            max_retries: None,
            prefetch_count: None,
        }
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets the retry bound.
    /// Defaults to 3.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    ///
    /// **Warning:** Setting this to a value greater than 1 means your `TaskHandler`
    /// may be called concurrently.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> Result<WorkerConfig> {
        let queue_name = self.queue_name;
        if queue_name == self.dead_letter_queue {
            return Err(QueueError::configuration(format!(
                "worker would dead-letter into its own queue '{}'",
                queue_name
            )));
        }

        let prefetch_count = self.prefetch_count.unwrap_or(1);
        if prefetch_count == 0 {
            return Err(QueueError::configuration("prefetch count must be at least 1"));
        }

        Ok(WorkerConfig {
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            retry_policy: self.max_retries.map(RetryPolicy::new).unwrap_or_default(),
            prefetch_count,
            queue_name,
            dead_letter_queue: self.dead_letter_queue,
        })
    }
}

/// The terminal or intermediate result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The task succeeded and the delivery was acknowledged.
    Succeeded,
    /// The task failed; the job was requeued with `retries` and the delivery acknowledged.
    Retried { retries: u32 },
    /// The task failed with no retries left; the job went to the DLQ.
    DeadLettered { retries: u32 },
    /// The body was not a job; it went to the DLQ verbatim.
    Undecodable,
}

/// A worker consuming the main queue, executing a [`TaskHandler`] per job and
/// requeueing or dead-lettering failed jobs.
///
/// Several workers may consume the same queue; the broker hands each message
/// to exactly one of them.
pub struct RetryWorker<H: TaskHandler, C = Channel> {
    handler: Arc<H>,
    channel: Arc<C>,
    config: WorkerConfig,
}

impl<H: TaskHandler, C: QueueChannel> RetryWorker<H, C> {
    /// Creates a new worker publishing retries and dead letters on `channel`.
    pub fn new(handler: Arc<H>, channel: Arc<C>, config: WorkerConfig) -> Self {
        Self { handler, channel, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs the state machine for one delivery.
    ///
    /// The delivery is acknowledged exactly once, and only after any
    /// replacement message (retry or dead letter) has been accepted by the
    /// broker. If that publish fails the delivery is never acknowledged: it is
    /// handed back to the broker for redelivery and the error is returned.
    pub async fn handle_delivery<A>(&self, body: &[u8], delivery: &A) -> Result<Outcome>
    where
        A: Acknowledge + ?Sized,
    {
        // The untyped form is what gets republished, so fields the handler's
        // payload type ignores survive a retry.
        let (raw, job) = match Job::<serde_json::Value>::decode(body)
            .and_then(|raw| Ok((raw, Job::<H::Payload>::decode(body)?)))
        {
            Ok(decoded) => decoded,
            Err(e) => {
                log::error!("Failed to parse message, sending to DLQ. Error: {}", e);
                let meta =
                    PublishMeta::dead_letter(0, DeadLetterReason::Undecodable, e.to_string());
                self.replace(delivery, &self.config.dead_letter_queue, Ok(body.to_vec()), &meta)
                    .await?;
                return Ok(Outcome::Undecodable);
            }
        };

        log::info!(
            "[{}] Processing job from '{}', attempt {}",
            self.handler.handler_name(),
            self.config.queue_name,
            job.attempt()
        );

        let error = match self.handler.process(&job).await {
            Ok(()) => {
                delivery.acknowledge().await?;
                log::info!("[{}] Job completed", self.handler.handler_name());
                return Ok(Outcome::Succeeded);
            }
            Err(e) => e,
        };

        log::warn!(
            "[{}] Task failed on attempt {}: {}",
            self.handler.handler_name(),
            job.attempt(),
            error
        );

        match self.config.retry_policy.decide(job.retries) {
            RetryDecision::Retry { next_retries } => {
                let retried = Job { payload: raw.payload, retries: next_retries };
                let meta = PublishMeta::retry(next_retries, error.to_string());
                self.replace(delivery, &self.config.queue_name, retried.encode(), &meta)
                    .await?;

                log::info!(
                    "Requeued job for retry {} of {}",
                    next_retries,
                    self.config.retry_policy.max_retries
                );
                Ok(Outcome::Retried { retries: next_retries })
            }
            RetryDecision::DeadLetter => {
                let meta = PublishMeta::dead_letter(
                    job.retries,
                    DeadLetterReason::MaxRetriesExceeded,
                    error.to_string(),
                );
                self.replace(delivery, &self.config.dead_letter_queue, raw.encode(), &meta)
                    .await?;

                log::warn!(
                    "Max retries ({}) reached, moved job to '{}'",
                    self.config.retry_policy.max_retries,
                    self.config.dead_letter_queue
                );
                Ok(Outcome::DeadLettered { retries: job.retries })
            }
        }
    }

    /// Publishes the message replacing `delivery`, then acknowledges it.
    ///
    /// When the replacement cannot be encoded or published, `delivery` is
    /// requeued instead so the broker hands it out again. A failed requeue is
    /// reported as [`QueueError::Acknowledge`], since the delivery is then
    /// stuck until its channel closes.
    async fn replace<A>(
        &self,
        delivery: &A,
        queue: &str,
        body: Result<Vec<u8>>,
        meta: &PublishMeta,
    ) -> Result<()>
    where
        A: Acknowledge + ?Sized,
    {
        let published = match body {
            Ok(body) => self.channel.publish(queue, &body, meta).await,
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            log::error!("Publish to '{}' failed, returning delivery to the queue: {}", queue, e);
            delivery.requeue().await?;
            return Err(e);
        }

        delivery.acknowledge().await
    }
}

impl<H: TaskHandler> RetryWorker<H, Channel> {
    /// Sets up the consumer on the main queue and runs the message processing loop.
    ///
    /// This function will run until the channel is closed or the consumer is cancelled.
    /// The application is responsible for handling reconnection and graceful shutdown.
    pub async fn run(&self) -> Result<()> {
        self.channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", self.config.prefetch_count);

        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue_name,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer started with tag '{}'. Waiting for messages...",
            consumer.tag().as_str()
        );

        consumer
            .map_err(QueueError::from)
            .try_for_each_concurrent(self.config.prefetch_count as usize, |delivery| async move {
                match self.handle_delivery(&delivery.data, &delivery).await {
                    Ok(_) => Ok(()),
                    // The delivery may still be unsettled; only closing the
                    // channel gets it redelivered.
                    Err(e @ QueueError::ChannelClosed { .. })
                    | Err(e @ QueueError::Lapin(_))
                    | Err(e @ QueueError::Acknowledge { .. }) => Err(e),
                    Err(e) => {
                        log::error!(
                            "Delivery {} requeued for redelivery: {}",
                            delivery.delivery_tag,
                            e
                        );
                        Ok(())
                    }
                }
            })
            .await?;

        log::warn!("Consumer on '{}' stopped", self.config.queue_name);
        Ok(())
    }
}

impl<H: TaskHandler> RetryWorker<H, InMemoryBroker> {
    /// Handles main-queue messages until the queue is empty, returning the
    /// outcome of every delivery in order.
    ///
    /// Stops at the first error. A delivery whose replacement could not be
    /// published is back at the head of the queue by then.
    pub async fn drain(&self) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.channel.receive(&self.config.queue_name) {
            outcomes.push(self.handle_delivery(&delivery.body, &delivery).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::job::RegistrationEmail;
    use crate::topology::QueueTopology;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every attempt whose prior retry count is in `fail_on`.
    struct Scripted {
        fail_on: Vec<u32>,
        seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(fail_on: Vec<u32>) -> Arc<Self> {
            Arc::new(Self { fail_on, seen: Mutex::new(Vec::new()) })
        }

        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        type Payload = RegistrationEmail;

        async fn process(
            &self,
            job: &Job<RegistrationEmail>,
        ) -> std::result::Result<(), TaskError> {
            self.seen.lock().unwrap().push(job.retries);
            if self.fail_on.contains(&job.retries) {
                Err(format!("simulated failure for {}", job.payload.email).into())
            } else {
                Ok(())
            }
        }

        fn handler_name(&self) -> &str {
            "scripted"
        }
    }

    async fn setup(
        handler: Arc<Scripted>,
    ) -> (Arc<InMemoryBroker>, RetryWorker<Scripted, InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        QueueTopology::new("emails", "emails_dlq").setup(broker.as_ref()).await.unwrap();
        let config = WorkerConfig::builder("emails", "emails_dlq").build().unwrap();
        let worker = RetryWorker::new(handler, broker.clone(), config);
        (broker, worker)
    }

    fn job_body(retries: u32) -> Vec<u8> {
        Job { payload: RegistrationEmail::new("ada@example.com"), retries }.encode().unwrap()
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        let config = WorkerConfig::builder("test_queue", "test_queue_dlq").build().unwrap();

        assert_eq!(config.queue_name, "test_queue");
        assert_eq!(config.dead_letter_queue, "test_queue_dlq");
        assert_eq!(config.consumer_tag, "test_queue_consumer");
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.retry_policy.max_retries, 3);
    }

    #[test]
    fn test_worker_config_builder_custom_values() {
        let config = WorkerConfig::builder("test_queue", "test_queue_dlq")
            .consumer_tag("custom_consumer")
            .prefetch_count(10)
            .max_retries(5)
            .build()
            .unwrap();

        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.retry_policy.max_retries, 5);
    }

    #[test]
    fn test_worker_config_rejects_invalid_values() {
        assert!(WorkerConfig::builder("q", "q").build().is_err());
        assert!(WorkerConfig::builder("q", "dlq").prefetch_count(0).build().is_err());
    }

    #[tokio::test]
    async fn test_success_acks_and_publishes_nothing() {
        let (broker, worker) = setup(Scripted::new(vec![])).await;
        broker.publish_raw("emails", &job_body(0));

        let delivery = broker.receive("emails").unwrap();
        let outcome = worker.handle_delivery(&delivery.body, &delivery).await.unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.unacked_count(), 0);
        assert!(broker.is_empty("emails"));
        assert!(broker.is_empty("emails_dlq"));
    }

    #[tokio::test]
    async fn test_failure_requeues_at_tail_with_incremented_retries() {
        let (broker, worker) = setup(Scripted::new(vec![1])).await;
        broker.publish_raw("emails", &job_body(1));
        broker.publish_raw("emails", br#"{"email":"other@example.com"}"#);

        let delivery = broker.receive("emails").unwrap();
        let outcome = worker.handle_delivery(&delivery.body, &delivery).await.unwrap();

        assert_eq!(outcome, Outcome::Retried { retries: 2 });
        assert_eq!(broker.unacked_count(), 0);
        let queued = broker.messages("emails");
        assert_eq!(queued.len(), 2);
        let requeued: Job<RegistrationEmail> = Job::decode(&queued[1].body).unwrap();
        assert_eq!(requeued.retries, 2);
        assert_eq!(requeued.payload.email, "ada@example.com");
        assert_eq!(queued[1].meta.retry_count, 2);
        assert!(queued[1].meta.last_exception.as_deref().unwrap().contains("simulated failure"));
    }

    #[tokio::test]
    async fn test_exhausted_job_goes_to_dlq_unchanged() {
        let (broker, worker) = setup(Scripted::new(vec![3])).await;
        broker.publish_raw("emails", &job_body(3));

        let delivery = broker.receive("emails").unwrap();
        let outcome = worker.handle_delivery(&delivery.body, &delivery).await.unwrap();

        assert_eq!(outcome, Outcome::DeadLettered { retries: 3 });
        assert!(broker.is_empty("emails"));
        let dead = broker.messages("emails_dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(Job::<RegistrationEmail>::decode(&dead[0].body).unwrap().retries, 3);
        assert_eq!(dead[0].meta.dead_letter_reason, Some(DeadLetterReason::MaxRetriesExceeded));
    }

    #[tokio::test]
    async fn test_retry_publish_failure_returns_delivery_to_head_of_queue() {
        let (broker, worker) = setup(Scripted::new(vec![0])).await;
        broker.publish_raw("emails", &job_body(0));
        broker.publish_raw("emails", br#"{"email":"next@example.com"}"#);
        broker.fail_next_publishes(1);

        let delivery = broker.receive("emails").unwrap();
        let err = worker.handle_delivery(&delivery.body, &delivery).await.unwrap_err();

        assert!(matches!(err, QueueError::Publish { .. }));
        assert_eq!(broker.acked_count(), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.len("emails"), 2);

        // Handed out again, untouched, before the job queued behind it.
        let redelivered = broker.receive("emails").unwrap();
        assert_eq!(redelivered.body, job_body(0));
    }

    #[tokio::test]
    async fn test_dlq_publish_failure_returns_delivery_to_queue() {
        let (broker, worker) = setup(Scripted::new(vec![3])).await;
        broker.publish_raw("emails", &job_body(3));
        broker.fail_next_publishes(1);

        let delivery = broker.receive("emails").unwrap();
        assert!(worker.handle_delivery(&delivery.body, &delivery).await.is_err());

        assert_eq!(broker.acked_count(), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert!(broker.is_empty("emails_dlq"));
        assert_eq!(broker.messages("emails")[0].body, job_body(3));

        // The next attempt goes through.
        let outcomes = worker.drain().await.unwrap();
        assert_eq!(outcomes, vec![Outcome::DeadLettered { retries: 3 }]);
        assert_eq!(broker.len("emails_dlq"), 1);
    }

    #[tokio::test]
    async fn test_failed_requeue_after_failed_publish_is_an_ack_error() {
        let (broker, worker) = setup(Scripted::new(vec![0])).await;
        broker.publish_raw("emails", &job_body(0));
        broker.fail_next_publishes(1);

        let delivery = broker.receive("emails").unwrap();
        // Settle it behind the worker's back so the requeue has nothing to return.
        delivery.acknowledge().await.unwrap();

        let err = worker.handle_delivery(&delivery.body, &delivery).await.unwrap_err();
        assert!(matches!(err, QueueError::Acknowledge { .. }));
    }

    #[tokio::test]
    async fn test_max_retry_count_in_body_is_dead_lettered() {
        let handler = Scripted::new(vec![u32::MAX]);
        let (broker, worker) = setup(handler.clone()).await;
        broker.publish_raw("emails", br#"{"email":"a@example.com","retries":4294967295}"#);

        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes, vec![Outcome::DeadLettered { retries: u32::MAX }]);
        assert_eq!(handler.seen(), vec![u32::MAX]);
        let dead = broker.messages("emails_dlq");
        assert_eq!(Job::<RegistrationEmail>::decode(&dead[0].body).unwrap().retries, u32::MAX);
        assert!(broker.is_empty("emails"));
    }

    #[tokio::test]
    async fn test_missing_retries_counts_as_first_attempt() {
        let handler = Scripted::new(vec![0]);
        let (broker, worker) = setup(handler.clone()).await;
        broker.publish_raw("emails", br#"{"email":"legacy@example.com"}"#);

        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes, vec![Outcome::Retried { retries: 1 }, Outcome::Succeeded]);
        assert_eq!(handler.seen(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unknown_fields_survive_a_retry() {
        let (broker, worker) = setup(Scripted::new(vec![0])).await;
        broker.publish_raw("emails", br#"{"email":"a@example.com","locale":"fr","retries":0}"#);

        let delivery = broker.receive("emails").unwrap();
        worker.handle_delivery(&delivery.body, &delivery).await.unwrap();

        let requeued: serde_json::Value =
            serde_json::from_slice(&broker.messages("emails")[0].body).unwrap();
        assert_eq!(
            requeued,
            serde_json::json!({ "email": "a@example.com", "locale": "fr", "retries": 1 })
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dead_lettered_verbatim() {
        let handler = Scripted::new(vec![]);
        let (broker, worker) = setup(handler.clone()).await;
        broker.publish_raw("emails", b"not json at all");

        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes, vec![Outcome::Undecodable]);
        assert!(handler.seen().is_empty());
        let dead = broker.messages("emails_dlq");
        assert_eq!(dead[0].body, b"not json at all".to_vec());
        assert_eq!(dead[0].meta.dead_letter_reason, Some(DeadLetterReason::Undecodable));
        assert_eq!(broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_json_missing_payload_fields_is_dead_lettered_verbatim() {
        let handler = Scripted::new(vec![]);
        let (broker, worker) = setup(handler.clone()).await;
        let body = br#"{"name":"x","retries":1}"#;
        broker.publish_raw("emails", body);

        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes, vec![Outcome::Undecodable]);
        assert!(handler.seen().is_empty());
        let dead = broker.messages("emails_dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, body.to_vec());
        assert_eq!(dead[0].meta.dead_letter_reason, Some(DeadLetterReason::Undecodable));
        assert_eq!(dead[0].meta.retry_count, 0);
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.unacked_count(), 0);
        assert!(broker.is_empty("emails"));
    }

    #[tokio::test]
    async fn test_ack_failure_is_reported() {
        let (broker, worker) = setup(Scripted::new(vec![])).await;
        broker.publish_raw("emails", &job_body(0));
        broker.fail_next_acks(1);

        let delivery = broker.receive("emails").unwrap();
        let err = worker.handle_delivery(&delivery.body, &delivery).await.unwrap_err();

        assert!(matches!(err, QueueError::Acknowledge { .. }));
        assert_eq!(broker.unacked_count(), 1);
    }
}
