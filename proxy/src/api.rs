//! Management API.
//!
//! Small axum surface for inspecting and mutating the route table, plus
//! health and Prometheus endpoints. Routes published here have the same
//! authority as any other publisher; last writer wins per hostname.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics;
use crate::routing::{Route, RouteStore, RouteTable};

#[derive(Clone)]
pub struct ApiState {
    pub routes: Arc<RouteTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertRoute {
    server_address: String,
    backend: String,
    #[serde(default)]
    waker_id: Option<String>,
    #[serde(default)]
    proxy_protocol: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertDefault {
    backend: String,
    #[serde(default)]
    waker_id: Option<String>,
    #[serde(default)]
    proxy_protocol: Option<bool>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route("/routes/{serverAddress}", axum::routing::delete(delete_route))
        .route("/defaultRoute", post(set_default_route))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_routes(State(state): State<ApiState>) -> Json<BTreeMap<String, String>> {
    let snapshot = state.routes.snapshot();
    let routes = snapshot
        .routes
        .into_iter()
        .map(|(hostname, route)| (hostname, route.backend))
        .collect();
    Json(routes)
}

async fn create_route(
    State(state): State<ApiState>,
    Json(body): Json<UpsertRoute>,
) -> impl IntoResponse {
    let route = Route {
        backend: body.backend,
        waker_id: body.waker_id,
        proxy_protocol: body.proxy_protocol,
    };
    let key = state.routes.set(&body.server_address, route);
    info!(hostname = %key, "route published via management API");
    StatusCode::CREATED
}

async fn delete_route(
    State(state): State<ApiState>,
    Path(server_address): Path<String>,
) -> impl IntoResponse {
    if state.routes.delete(&server_address) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn set_default_route(
    State(state): State<ApiState>,
    Json(body): Json<UpsertDefault>,
) -> impl IntoResponse {
    state.routes.set_default(Route {
        backend: body.backend,
        waker_id: body.waker_id,
        proxy_protocol: body.proxy_protocol,
    });
    StatusCode::OK
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// Serve the management API until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
