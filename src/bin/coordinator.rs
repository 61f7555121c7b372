use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use worldcomm::auth::Authenticator;
use worldcomm::config::{read_configuration, CoordinatorConfig};
use worldcomm::coordinator::{Coordinator, CoordinatorStats, RandomSelector};

#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "Worldcomm membership and signaling service")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config/coordinator.json")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config: CoordinatorConfig = read_configuration(&args.config)?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let auth = Arc::new(
        Authenticator::third_party(
            &config.identity_url,
            config.server_secret.clone(),
            config.auth_ttl,
        )
        .await?,
    );

    let reporter = Box::new(|stats: &CoordinatorStats| {
        tracing::info!(
            log_type = "report",
            client_count = stats.client_count,
            server_count = stats.server_count,
            "report"
        );
    });

    tracing::info!(version = worldcomm::version(), "starting coordinator");
    let coordinator = Coordinator::new(config, auth, Box::new(RandomSelector::new()), reporter);
    coordinator.serve().await?;
    Ok(())
}
