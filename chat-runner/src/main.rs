use anyhow::Result;
use chat_api::{run as run_api, run_reconciler, ApiState};
use chat_core::Config;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting recruiter chat sync server");

    // Load configuration
    let config = Config::from_env();
    let reconcile_interval = config.sync.reconcile_interval();
    let ctx = chat_store::connect(config).await?;

    tracing::info!("Sync context initialized ({:?} backend)", ctx.config.sync.backend);

    let state = ApiState::new(ctx);

    match reconcile_interval {
        Some(interval) => {
            let sessions = state.sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = run_reconciler(sessions, interval).await {
                    tracing::error!("Reconciler error: {}", e);
                }
            });
        }
        None => tracing::info!("Periodic reconciliation disabled"),
    }

    // API server runs in main task
    run_api(state).await?;

    Ok(())
}
