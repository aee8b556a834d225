//! HTTP endpoint for the map view: the current position as `{lat, lon}`,
//! plus the full telemetry frame for web dashboards.

pub mod doctor;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gcs_fc::sampler::Telemetry;
use gcs_fc::CancelToken;
use gcs_proto::telemetry::MapPosition;
use tokio::net::TcpListener;
use tracing::info;

/// Bind the map endpoint's socket.
pub async fn listen(bind: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind map server on {}", bind))?;
    info!("map: location endpoint http://{}/location", bind);
    Ok(listener)
}

pub struct MapServer {
    telemetry: Telemetry,
}

impl MapServer {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/location", get(location_handler))
            .route("/telemetry", get(telemetry_handler))
            .route("/health", get(health_handler))
            .with_state(self.telemetry.clone())
    }

    pub async fn serve(self, bind: &str, cancel: CancelToken) -> Result<()> {
        let listener = listen(bind).await?;
        self.serve_on(listener, cancel).await
    }

    pub async fn serve_on(self, listener: TcpListener, cancel: CancelToken) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("map server")?;
        info!("map: stopped");
        Ok(())
    }
}

fn no_fix() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "no telemetry yet").into_response()
}

async fn location_handler(State(telemetry): State<Telemetry>) -> Response {
    let latest = telemetry.borrow().clone();
    match latest {
        Some(snap) => Json(MapPosition { lat: snap.state.location.lat, lon: snap.state.location.lon }).into_response(),
        None => no_fix(),
    }
}

async fn telemetry_handler(State(telemetry): State<Telemetry>) -> Response {
    let latest = telemetry.borrow().clone();
    match latest {
        Some(snap) => Json(snap.frame()).into_response(),
        None => no_fix(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
