//! Server wiring: builds the application from a [`GatewayConfig`] and serves it.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;
use url::Url;

use crate::api;
use crate::backend::{CachingTenancy, MemoryFactory, TenancyDirectory};
use crate::config::GatewayConfig;
use crate::viewer::{TenancyResolver, UpgradeBridge};

/// Build the router for `config`. `metrics` enables the `/metrics` route.
pub fn build_app(config: &GatewayConfig, metrics: Option<PrometheusHandle>) -> Result<Router> {
    let directory: Arc<dyn TenancyDirectory> = Arc::new(CachingTenancy::new(
        MemoryFactory::with_tenants(config.tenants.iter().cloned()),
    ));

    let bridge = match config.auth_url.as_deref() {
        Some(raw) => {
            let auth_url =
                Url::parse(raw).with_context(|| format!("Invalid auth_url `{}`", raw))?;
            Some(UpgradeBridge::new(auth_url)?)
        }
        None => None,
    };

    Ok(api::create_router(
        TenancyResolver::with_directory(directory),
        bridge,
        config.request_timeout(),
        metrics,
    ))
}

/// Serve until Ctrl-C.
pub async fn serve(config: &GatewayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let app = build_app(config, metrics)?;
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;

    match config.auth_url.as_deref() {
        Some(auth_url) => info!(
            "Tenant viewer listening on http://{} (upgrade auth via {})",
            config.bind, auth_url
        ),
        None => info!("Tenant viewer listening on http://{}", config.bind),
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Tenant viewer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
