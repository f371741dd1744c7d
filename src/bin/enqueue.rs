//! Enqueues one registration email job, the way the registration endpoint would.

use clap::Parser;
use reliable_mail_queue::{BrokerConnection, Producer, QueueSettings, RegistrationEmail};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "enqueue")]
#[command(about = "Queue a registration email for delivery by the worker")]
struct Cli {
    /// Recipient address.
    #[arg(long)]
    email: String,

    /// Recipient display name.
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    settings: QueueSettings,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = cli.settings.validate() {
        log::error!("{}", e);
        std::process::exit(1);
    }

    // Without a channel nothing can be queued, so connection failures are fatal.
    let connection = match BrokerConnection::connect(&cli.settings.rabbit_url).await {
        Ok(connection) => connection,
        Err(_) => std::process::exit(1),
    };
    let channel = match connection.open_channel().await {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            log::error!("Failed to open channel: {}", e);
            std::process::exit(1);
        }
    };

    let producer = Producer::with_channel(&cli.settings.main_queue, channel);
    let mut payload = RegistrationEmail::new(cli.email);
    if let Some(name) = cli.name {
        payload = payload.with_name(name);
    }

    let queued = producer.enqueue(payload).await;

    if let Err(e) = connection.close().await {
        log::warn!("Error while closing connection: {}", e);
    }

    match queued {
        Ok(()) => log::info!("User registered! Email will be sent soon."),
        Err(_) => {
            log::error!("Failed to queue email.");
            std::process::exit(1);
        }
    }
}
