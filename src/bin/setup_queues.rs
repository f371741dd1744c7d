//! Declares the main queue and its dead-letter queue, then exits.
//!
//! Run once before starting producers or workers. Safe to re-run.

use clap::Parser;
use reliable_mail_queue::{BrokerConnection, QueueSettings};

#[derive(Parser, Debug)]
#[command(name = "setup-queues")]
#[command(about = "Declare the durable main queue and its dead-letter queue")]
struct Cli {
    #[command(flatten)]
    settings: QueueSettings,
}

async fn setup(settings: &QueueSettings) -> reliable_mail_queue::Result<()> {
    settings.validate()?;

    let connection = BrokerConnection::connect(&settings.rabbit_url).await?;
    let channel = connection.open_channel().await?;
    settings.topology().setup(&channel).await?;

    channel.close(200, "OK").await?;
    connection.close().await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = setup(&cli.settings).await {
        log::error!("Queue setup failed: {}", e);
        std::process::exit(1);
    }
    log::info!("Queues setup done!");
}
