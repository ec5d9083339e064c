use app::{AppConfig, init};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let services = init(&config).await?;
    tracing::info!(
        "Serving models from {} with database {}",
        services.installs.models_dir().display(),
        config.db_endpoint
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    services.shutdown().await?;
    Ok(())
}
