//! HTTP surface: router, shared state and the serve loop

use crate::{HealthReport, RateLimiter, Screenshot, ScreenshotQuery, ScreenshotService, ServiceError};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScreenshotService>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<ScreenshotService>) -> Self {
        Self {
            service,
            rate_limiter: None,
            prometheus: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Builds the application router.
///
/// The rate limiter only guards the screenshot route; health and metrics stay
/// reachable for probes.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new().route("/", get(screenshot));

    if let Some(limiter) = state.rate_limiter.clone() {
        app = app.route_layer(middleware::from_fn_with_state(limiter, crate::rate_limit::enforce));
    }

    app = app.route("/health", get(health));
    if state.prometheus.is_some() {
        app = app.route("/metrics", get(metrics));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn screenshot(
    State(state): State<AppState>,
    Query(query): Query<ScreenshotQuery>,
) -> Result<Screenshot, ServiceError> {
    state.service.screenshot(&query).await
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let rate_limit_store = state.rate_limiter.as_ref().map(|l| l.store_name());
    Json(HealthReport::collect(&state.service, rate_limit_store))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves `app` on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Screenshot server listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}
