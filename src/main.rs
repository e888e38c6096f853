//! Ask Ellis - HTTP Server Entry Point

use ask_ellis::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ask_ellis=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        model = %config.default_model,
        config_dir = %config.config_dir.display(),
        max_retries = config.workflow.max_retries,
        "Loaded configuration"
    );

    api::serve(config).await
}
