use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use worldcomm::auth::Authenticator;
use worldcomm::config::{read_configuration, ServerConfig};
use worldcomm::reporter::tracing_sink;
use worldcomm::server::CommServer;

#[derive(Parser, Debug)]
#[command(name = "comm-server", about = "Worldcomm communication server (relay)")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config/server.json")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config: ServerConfig = read_configuration(&args.config)?;
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

    tracing::info!(version = worldcomm::version(), "starting communication server");
    let server = CommServer::new(config, auth, tracing_sink());

    let handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
