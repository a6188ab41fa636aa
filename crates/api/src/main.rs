use std::sync::Arc;

use anyhow::Context;

use mailrelay_api::app::{build_app, config::AppConfig, services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailrelay_observability::init();

    let config = AppConfig::from_env();
    let services = Arc::new(services::build_services(&config).await?);
    let dispatcher = services.dispatcher.clone().spawn();

    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
