use anyhow::Context;

use taskpulse_infra::config::AppConfig;
use taskpulse_worker::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskpulse_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let app = App::connect(config).await.context("failed to connect backends")?;
    let running = app.start();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    running.shutdown().await;

    Ok(())
}
