mod service;

use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_core::config::core_config_from_lookup;
use service::{AppState, ServiceState, build_router, run_scheduler};

/// Default seconds between scheduled runs.
const DEFAULT_RUN_INTERVAL_SECS: u64 = 30;

/// Main entry point for the Sentinel service
///
/// Loads the defect ledger from the shared volume, starts the run scheduler and serves the REST
/// API (with OpenAPI/Swagger UI) until the process is stopped.
///
/// # Environment Variables
/// - `SENTINEL_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `SENTINEL_RUN_INTERVAL_SECS`: seconds between scheduled runs (default: 30)
/// - `SENTINEL_DATA_DIR`, `SENTINEL_BATCH_SIZE`, `SENTINEL_CHAOS`, `SENTINEL_CHAOS_DEFECTS`,
///   `SENTINEL_CHAOS_RATE`, `SENTINEL_CHAOS_SEED`, `SENTINEL_DISABLED_RULES`: pipeline settings
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - any configuration value is invalid or the existing ledger cannot be loaded,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sentinel_run=info".parse()?)
                .add_directive("sentinel_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("SENTINEL_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let interval_secs = match std::env::var("SENTINEL_RUN_INTERVAL_SECS") {
        Ok(v) if !v.trim().is_empty() => v.trim().parse::<u64>().map_err(|e| {
            anyhow::anyhow!("SENTINEL_RUN_INTERVAL_SECS={v:?}: {e}")
        })?,
        _ => DEFAULT_RUN_INTERVAL_SECS,
    };
    if interval_secs == 0 {
        anyhow::bail!("SENTINEL_RUN_INTERVAL_SECS must be at least 1");
    }

    let config = core_config_from_lookup(|name| std::env::var(name).ok())?;
    tracing::info!(
        "++ Sentinel data directory {}, batch size {}, chaos {}",
        config.data_dir().display(),
        config.batch_size(),
        if config.chaos().enabled { "on" } else { "off" }
    );

    let state = AppState::new(ServiceState::load(config)?, true);
    tokio::spawn(run_scheduler(
        state.clone(),
        Duration::from_secs(interval_secs),
    ));

    tracing::info!("++ Starting Sentinel REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}
