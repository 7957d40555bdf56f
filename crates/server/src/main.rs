mod api;
mod bootstrap;
mod health;
pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use mailroom_core::config::{AppConfig, LoadOptions};
use mailroom_core::workflow::WorkflowService;

/// How often awaiting workflows are checked for an elapsed decision
/// window.
const TIMER_SWEEP_SECS: u64 = 60;

fn init_logging(config: &AppConfig) {
    use mailroom_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Now bootstrap using the same config we already loaded
    let app = bootstrap::bootstrap_with_config(config).await?;

    let router = api::router(Arc::clone(&app.pipeline), Arc::clone(&app.workflows))
        .merge(health::router(app.db_pool.clone()));
    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        router,
    )
    .await?;

    spawn_timer_sweep(Arc::clone(&app.workflows));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "mailroom-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "mailroom-server stopping"
    );

    Ok(())
}

/// Periodically resolves approval workflows whose decision window has
/// elapsed. Sweep errors are logged and the loop keeps running.
fn spawn_timer_sweep(workflows: Arc<WorkflowService>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(TIMER_SWEEP_SECS));
        loop {
            ticker.tick().await;
            match workflows.fire_due_timers(Utc::now()).await {
                Ok(resolved) if !resolved.is_empty() => {
                    tracing::info!(
                        event_name = "system.timer_sweep.resolved",
                        count = resolved.len(),
                        "auto-resolved workflows past their decision window"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        event_name = "system.timer_sweep.failed",
                        error = %error,
                        "timer sweep failed; will retry on the next tick"
                    );
                }
            }
        }
    });
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
