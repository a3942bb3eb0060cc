pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{health_controller::HealthController, proxy_controller::ProxyController};
use services::ProxyServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub struct ProxyApplicationServer;

impl ProxyApplicationServer {
    /// the whole http surface, split out of `serve` so tests can drive it with mocked services
    pub fn router(services: ProxyServices, metrics: Option<PrometheusHandle>) -> Router {
        let max_concurrent_requests = services.config.max_concurrent_requests;

        let mut router = Router::new()
            .route("/health", get(HealthController::health_endpoint))
            .nest("/proxy", ProxyController::app());

        if let Some(handle) = metrics {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        // one semaphore shared by every route, the layer is applied per endpoint
        router
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http())
            .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests))
    }

    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        Lazy::force(&START_TIME);

        let services = ProxyServices::new(config.clone()).context("failed to start services")?;

        // a second recorder (tests, embedding) just means no /metrics, not a dead server
        let metrics = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("metrics recorder not installed: {}", e);
                None
            }
        };

        let router = Self::router(services, metrics);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        info!("proxy listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("error while serving")?;

        info!("proxy shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, draining connections...");
}
