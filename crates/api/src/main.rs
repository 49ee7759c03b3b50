use std::sync::Arc;

use anyhow::Context;
use fulfillment_infra::FulfillmentConfig;
use tracing::{error, info};

use fulfillment_api::app::{self, services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fulfillment_observability::init();

    let config = FulfillmentConfig::from_env().context("invalid configuration")?;
    info!(config = ?config, "configuration loaded");

    let services = Arc::new(services::build_services(&config).await?);
    let runtime = services.runtime(&config.jobs).start();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    let served = axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    runtime.shutdown().await;
    served.context("http server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
