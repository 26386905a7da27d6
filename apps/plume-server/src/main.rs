#![forbid(unsafe_code)]

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use plume_server::{build_router_with_pipeline, init_tracing, AppConfig, ProxyPipeline};
use tokio::net::TcpListener;

fn env_parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name).map_or_else(
        |_| Ok(default),
        |value| {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}"))
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let relay_token = std::env::var("PLUME_RELAY_TOKEN")
        .map_err(|_| anyhow::anyhow!("PLUME_RELAY_TOKEN is required for runtime"))?;
    let application_id = std::env::var("PLUME_APPLICATION_ID")
        .map_err(|_| anyhow::anyhow!("PLUME_APPLICATION_ID is required for runtime"))?
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("invalid PLUME_APPLICATION_ID: {e}"))?;
    let origin_delete_delay_millis = env_parsed(
        "PLUME_ORIGIN_DELETE_DELAY_MILLIS",
        u64::try_from(defaults.origin_delete_delay.as_millis()).unwrap_or(u64::MAX),
    )?;
    let maintenance_interval_secs = env_parsed(
        "PLUME_MAINTENANCE_INTERVAL_SECS",
        defaults.maintenance_interval.as_secs(),
    )?;
    if maintenance_interval_secs == 0 {
        return Err(anyhow::anyhow!(
            "PLUME_MAINTENANCE_INTERVAL_SECS must be at least 1"
        ));
    }
    let max_attachment_bytes =
        env_parsed("PLUME_MAX_ATTACHMENT_BYTES", defaults.max_attachment_bytes)?;

    let app_config = AppConfig {
        database_url: std::env::var("PLUME_DATABASE_URL").ok(),
        relay_api_url: std::env::var("PLUME_RELAY_API_URL")
            .unwrap_or_else(|_| defaults.relay_api_url.clone()),
        relay_token,
        application_id,
        origin_delete_delay: Duration::from_millis(origin_delete_delay_millis),
        maintenance_interval: Duration::from_secs(maintenance_interval_secs),
        max_attachment_bytes,
        ..defaults
    };

    let pipeline = Arc::new(ProxyPipeline::from_config(&app_config)?);
    let app = build_router_with_pipeline(&app_config, pipeline.clone())?;
    let maintenance = pipeline.spawn_maintenance(app_config.maintenance_interval);

    let addr = std::env::var("PLUME_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid PLUME_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "plume-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    tracing::info!(
        event = "server.shutdown",
        pending = pipeline.orchestrator().background().pending(),
        "draining origin deletions"
    );
    pipeline.settle().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(event = "server.shutdown", error = %error, "ctrl-c handler failed");
    }
}
