//! Long-running worker sending registration emails from the main queue.

use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use reliable_mail_queue::{
    BrokerConnection, Job, QueueSettings, RegistrationEmail, RetryWorker, TaskError, TaskHandler,
    WorkerConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Consume registration email jobs with retries and dead-lettering")]
struct Cli {
    #[command(flatten)]
    settings: QueueSettings,

    /// Fraction of send attempts that fail on purpose, for trying out retries.
    #[arg(long, env = "FAIL_RATE", default_value_t = 0.0)]
    fail_rate: f64,

    /// Simulated time to send one email, in milliseconds.
    #[arg(long, env = "SEND_DELAY_MS", default_value_t = 2000)]
    send_delay_ms: u64,

    /// Seconds to wait before reconnecting after the broker goes away.
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,
}

/// Stand-in for the mail provider call.
struct RegistrationMailer {
    fail_rate: f64,
    send_delay: Duration,
}

#[async_trait]
impl TaskHandler for RegistrationMailer {
    type Payload = RegistrationEmail;

    fn handler_name(&self) -> &str {
        "RegistrationMailer"
    }

    async fn process(&self, job: &Job<RegistrationEmail>) -> Result<(), TaskError> {
        let email = &job.payload.email;
        log::info!("Processing: {}, attempt: {}", email, job.attempt());

        let fail = rand::thread_rng().gen_bool(self.fail_rate);
        if fail {
            return Err(TaskError::from(format!("Simulated send failure for {}", email)));
        }

        tokio::time::sleep(self.send_delay).await;
        log::info!("Registration email sent to {}", email);
        Ok(())
    }
}

async fn connect_worker(
    settings: &QueueSettings,
    handler: Arc<RegistrationMailer>,
    config: WorkerConfig,
) -> reliable_mail_queue::Result<(BrokerConnection, RetryWorker<RegistrationMailer>)> {
    let connection = BrokerConnection::connect(&settings.rabbit_url).await?;
    let channel = Arc::new(connection.open_channel().await?);
    Ok((connection, RetryWorker::new(handler, channel, config)))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match cli.settings.worker_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    if !(0.0..=1.0).contains(&cli.fail_rate) {
        log::error!("--fail-rate must be between 0 and 1, got {}", cli.fail_rate);
        std::process::exit(1);
    }

    let handler = Arc::new(RegistrationMailer {
        fail_rate: cli.fail_rate,
        send_delay: Duration::from_millis(cli.send_delay_ms),
    });
    let reconnect_delay = Duration::from_secs(cli.reconnect_delay_secs);

    // A worker that cannot reach the broker at startup has nothing to do.
    let mut session = match connect_worker(&cli.settings, handler.clone(), config.clone()).await {
        Ok(session) => Some(session),
        Err(e) => {
            log::error!("Failed to connect to RabbitMQ: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("Worker connected. Waiting for messages on '{}'...", config.queue_name);

    // The application is in control of the run loop and of reconnecting.
    loop {
        let (connection, worker) = match session.take() {
            Some(session) => session,
            None => match connect_worker(&cli.settings, handler.clone(), config.clone()).await {
                Ok(session) => session,
                Err(e) => {
                    log::error!("Reconnect failed: {}. Retrying in {:?}...", e, reconnect_delay);
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            },
        };

        tokio::select! {
            // Listen for Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received. Shutting down.");
                if let Err(e) = connection.close().await {
                    log::warn!("Error while closing connection: {}", e);
                }
                break;
            },

            result = worker.run() => {
                match result {
                    Ok(()) => {
                        log::info!("Worker finished unexpectedly. Will not reconnect.");
                        break;
                    }
                    Err(e) => {
                        log::error!(
                            "Worker failed: {}. Reconnecting in {:?}...",
                            e,
                            reconnect_delay
                        );
                        // Unsettled deliveries go back to the queue once the session is gone.
                        if let Err(e) = connection.close().await {
                            log::warn!("Error while closing connection: {}", e);
                        }
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    }

    log::info!("Worker has shut down.");
}
