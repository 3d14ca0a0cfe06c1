//! agora-eventd - relay and consumer host for the agora event-delivery
//! subsystem.

mod app;

use agora_config::{init_logging, Config};
use clap::Parser;

/// agora-eventd command-line interface.
#[derive(Parser)]
#[command(name = "agora-eventd")]
#[command(about = "Relays outbox events to the broker and hosts consumers")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "AGORA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Postgres connection URL for the outbox table
    #[arg(long, env = "AGORA_DATABASE_URL")]
    database_url: Option<String>,

    /// AMQP connection URI
    #[arg(long, env = "AGORA_BROKER_URL")]
    broker_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(url) = cli.broker_url {
        config.broker_url = url;
    }

    init_logging(&config.log_level, cli.json_logs);

    let summary = app::run(config, Vec::new()).await?;
    if !summary.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
