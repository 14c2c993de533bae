// HTTP endpoints for the tenant viewer service

use std::time::Duration;

use axum::{
    Router,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::backend;
use crate::context::{Context, ContextLayer};
use crate::viewer::{self, TenancyLayer, TenancyResolver, UpgradeBridge, UpgradeBridgeLayer};

/// Build the service router.
///
/// `/healthz` and `/metrics` (when a handle is given) are served without
/// identity. Every other route requires a viewer and runs behind the
/// upgrade bridge (when configured) and the tenancy layer.
pub fn create_router(
    resolver: TenancyResolver,
    bridge: Option<UpgradeBridge>,
    request_timeout: Duration,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let scoped = Router::new()
        .route("/viewer", get(current_viewer))
        .route("/ws", get(viewer_socket));

    let open = Router::new().route("/healthz", get(health_check));
    let open = match metrics {
        Some(handle) => open.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        None => open,
    };

    open.merge(tenant_scoped(scoped, resolver, bridge))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ContextLayer::with_timeout(request_timeout)),
        )
}

/// Put `router` behind the identity pipeline.
pub fn tenant_scoped(
    router: Router,
    resolver: TenancyResolver,
    bridge: Option<UpgradeBridge>,
) -> Router {
    // Layers added later run first: the bridge must see the request before
    // the tenancy layer reads the identity headers.
    let router = router.layer(TenancyLayer::new(resolver));
    match bridge {
        Some(bridge) => router.layer(UpgradeBridgeLayer::new(bridge)),
        None => router,
    }
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Describe the caller as resolved by the tenancy layer.
async fn current_viewer(ctx: Context) -> Result<Json<Value>, StatusCode> {
    let viewer = viewer::from_context(&ctx).ok_or(StatusCode::UNAUTHORIZED)?;
    let read_only = backend::from_context(&ctx).map(|client| client.is_read_only());

    Ok(Json(serde_json::json!({
        "viewer": viewer.as_ref(),
        "read_only": read_only,
    })))
}

/// Send the viewer as the first frame of the socket, then close it.
async fn viewer_socket(ctx: Context, ws: WebSocketUpgrade) -> Response {
    let Some(viewer) = viewer::from_context(&ctx) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| greet(socket, viewer))
}

async fn greet(mut socket: WebSocket, viewer: std::sync::Arc<viewer::Viewer>) {
    let text = match serde_json::to_string(viewer.as_ref()) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode viewer: {}", e);
            return;
        }
    };

    if let Err(e) = socket.send(Message::Text(text.into())).await {
        debug!("WebSocket send failed: {}", e);
        return;
    }
    if let Err(e) = socket.send(Message::Close(None)).await {
        debug!("WebSocket close failed: {}", e);
    }
}
