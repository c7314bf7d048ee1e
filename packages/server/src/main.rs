use anyhow::Context;
use server::config::AppConfig;
use server::pipeline::PipelineHost;
use server::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = AppConfig::load().context("Failed to load config")?;
    info!(
        event_log = %config.event_log.path.display(),
        blobs = %config.storage.path.display(),
        tenant = %config.pipeline.tenant,
        "Docstore starting"
    );

    let state = AppState::build(&config)
        .await
        .context("Failed to initialize stores")?;

    let cancel = CancellationToken::new();
    let host = tokio::spawn(PipelineHost::new(state, config).run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = host.await {
        error!(error = %e, "Pipeline host terminated abnormally");
    }
    Ok(())
}
