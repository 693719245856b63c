//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations by result
    pub static ref RECONCILE_TOTAL: CounterVec = register_counter_vec!(
        "reconcile_engine_reconcile_total",
        "Total number of reconciliations per controller and result",
        &["controller", "result"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILE_ERRORS: CounterVec = register_counter_vec!(
        "reconcile_engine_reconcile_errors_total",
        "Total number of reconciliation errors per controller",
        &["controller"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "reconcile_engine_reconcile_time_seconds",
        "Duration of reconciliations in seconds",
        &["controller"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    /// Workers currently inside the reconciler
    pub static ref ACTIVE_WORKERS: GaugeVec = register_gauge_vec!(
        "reconcile_engine_active_workers",
        "Number of workers currently running a reconcile",
        &["controller"]
    ).unwrap();

    /// Configured worker count
    pub static ref MAX_CONCURRENT_RECONCILES: GaugeVec = register_gauge_vec!(
        "reconcile_engine_max_concurrent_reconciles",
        "Maximum number of concurrent reconciles per controller",
        &["controller"]
    ).unwrap();

    /// Event dispatch tasks that ended with a panic
    pub static ref WATCH_FAILURES: CounterVec = register_counter_vec!(
        "reconcile_engine_watch_failures_total",
        "Total number of event dispatch tasks that failed per controller",
        &["controller"]
    ).unwrap();

    /// Keys ready in the work queue
    pub static ref WORKQUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "reconcile_engine_workqueue_depth",
        "Current depth of the work queue",
        &["name"]
    ).unwrap();

    /// Adds handled by the work queue
    pub static ref WORKQUEUE_ADDS: CounterVec = register_counter_vec!(
        "reconcile_engine_workqueue_adds_total",
        "Total number of adds handled by the work queue",
        &["name"]
    ).unwrap();

    /// Rate-limited requeues handled by the work queue
    pub static ref WORKQUEUE_RETRIES: CounterVec = register_counter_vec!(
        "reconcile_engine_workqueue_retries_total",
        "Total number of retries handled by the work queue",
        &["name"]
    ).unwrap();

    /// Engine health (1 = healthy, 0 = unhealthy)
    pub static ref ENGINE_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "reconcile_engine_health",
        "Engine health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Serve `/metrics`, `/healthz` and `/readyz` on `port` until the listener fails
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    set_ready(true);

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(route))
                .await
            {
                debug!(%peer, error = %e, "Metrics connection closed with error");
            }
        });
    }
}

async fn route(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Encode every registered metric in the text exposition format
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

/// Mark the engine ready or not ready; `/readyz` follows this
pub fn set_ready(ready: bool) {
    ENGINE_HEALTH.set(if ready { 1.0 } else { 0.0 });
}

/// Ready while the engine reports itself healthy
fn ready_response() -> Response<Full<Bytes>> {
    if ENGINE_HEALTH.get() >= 1.0 {
        text(StatusCode::OK, "ok")
    } else {
        text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_metrics_response_contains_engine_metrics() {
        RECONCILE_TOTAL
            .with_label_values(&["metrics-test", "success"])
            .inc();

        let response = metrics_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("reconcile_engine_reconcile_total"));
        assert!(text.contains("metrics-test"));
    }

    #[tokio::test]
    async fn test_text_response() {
        let response = text(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Not Found");
    }

    #[test]
    fn test_readiness_follows_engine_health() {
        set_ready(false);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        set_ready(true);
        assert_eq!(ready_response().status(), StatusCode::OK);
    }
}
