use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

/// Readiness probe: the daemon is ready when at least one sandbox driver
/// is healthy.
#[async_trait::async_trait]
pub trait ReadinessChecker: Send + Sync {
    async fn ready(&self) -> bool;
}

#[derive(Clone)]
struct AppState {
    registry: Registry,
    readiness: Arc<dyn ReadinessChecker>,
}

pub fn observability_router(registry: Registry, readiness: Arc<dyn ReadinessChecker>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(AppState {
            registry,
            readiness,
        })
}

/// Serve /healthz, /readyz, and /metrics until the token is canceled.
/// Local-only by convention; the bind address comes from config.
pub async fn serve_observability(
    addr: String,
    registry: Registry,
    readiness: Arc<dyn ReadinessChecker>,
    cancel: CancellationToken,
) {
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "observability server failed to bind");
            return;
        }
    };

    tracing::info!(addr = %addr, "observability server starting");
    let app = observability_router(registry, readiness);
    let shutdown = cancel.cancelled_owned();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "observability server failed");
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.readiness.ready().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("encode metrics: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buf,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagReadiness(AtomicBool);

    #[async_trait::async_trait]
    impl ReadinessChecker for FlagReadiness {
        async fn ready(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    async fn start(ready: bool) -> (String, CancellationToken) {
        let registry = Registry::new();
        let m = crate::daemon::metrics::Metrics::new(&registry);
        m.directives_total.with_label_values(&["succeeded"]).inc();

        let readiness = Arc::new(FlagReadiness(AtomicBool::new(ready)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let app = observability_router(registry, readiness);
        let shutdown = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .unwrap();
        });
        (addr, cancel)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (addr, _cancel) = start(true).await;
        let resp = reqwest::get(format!("{addr}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn readyz_reflects_driver_health() {
        let (addr, _cancel) = start(true).await;
        let resp = reqwest::get(format!("{addr}/readyz")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let (addr, _cancel) = start(false).await;
        let resp = reqwest::get(format!("{addr}/readyz")).await.unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.text().await.unwrap(), "not ready");
    }

    #[tokio::test]
    async fn metrics_expose_prometheus_text() {
        let (addr, _cancel) = start(true).await;
        let resp = reqwest::get(format!("{addr}/metrics")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.contains("nexusd_directives_total"), "{body}");
    }
}
