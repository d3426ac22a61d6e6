//! taskgate server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskgate::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "Starting taskgate on {}:{} (data dir {})",
        config.host,
        config.port,
        config.data_dir.display()
    );

    api::serve(config).await
}
