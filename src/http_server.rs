use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::SystemTime};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::metrics::ProxyMetrics;

/// HTTP server exposing `/health` and `/metrics` alongside the proxy listener.
pub struct HttpServer {
    metrics: Arc<ProxyMetrics>,
    bind_addr: SocketAddr,
    startup_time: SystemTime,
}

impl HttpServer {
    pub fn new(metrics: Arc<ProxyMetrics>, bind_addr: SocketAddr) -> Self {
        Self {
            metrics,
            bind_addr,
            startup_time: SystemTime::now(),
        }
    }

    /// Starts serving until `shutdown` fires.
    pub async fn start(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let app_state = AppState {
            metrics: self.metrics,
            startup_time: self.startup_time,
        };

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(prometheus_metrics))
            .with_state(app_state)
            .layer(CorsLayer::permissive());

        info!("starting HTTP server on {}", self.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<ProxyMetrics>,
    startup_time: SystemTime,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = SystemTime::now()
        .duration_since(state.startup_time)
        .unwrap_or_default()
        .as_secs();

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "sessions_active": state.metrics.sessions_active(),
            "uptime_seconds": uptime,
        })),
    )
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.export() {
        Ok(metrics) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(metrics)
            .unwrap(),
        Err(e) => {
            error!("failed to export metrics: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("failed to export metrics".to_string())
                .unwrap()
        }
    }
}
