use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{Router, http::StatusCode, routing::get};
use metrics::histogram;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

/// Register an existing Prometheus handle without installing a new recorder.
/// Useful when embedding the bridge into another binary that already installed
/// a global recorder.
pub fn register_metrics_handle(handle: PrometheusHandle) -> PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| handle).clone()
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> anyhow::Result<()> {
    serve_metrics_with_shutdown(handle, addr, std::future::pending::<()>()).await
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_cli_call(subcommand: &str, result: &str) {
    counter!(
        "tailbridge_cli_calls_total",
        "subcommand" => subcommand.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_service_apply(op: &str, result: &str) {
    counter!(
        "tailbridge_service_applies_total",
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_lifecycle_event(action: &str) {
    counter!(
        "tailbridge_lifecycle_events_total",
        "action" => action.to_string()
    )
    .increment(1);
}

pub fn record_event_stream_restart() {
    counter!("tailbridge_event_stream_restarts_total").increment(1);
}

pub fn record_reconcile_result(result: &str) {
    counter!(
        "tailbridge_reconcile_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_reconcile_duration(result: &str, duration: Duration) {
    histogram!(
        "tailbridge_reconcile_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

pub fn record_managed_services(count: usize) {
    gauge!("tailbridge_managed_services").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_exposes_counters() {
        let handle = init_metrics_recorder();
        record_reconcile_result("converged");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn({
            let handle = handle.clone();
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let body = handle.render();
                    async move {
                        (
                            StatusCode::OK,
                            [(
                                axum::http::header::CONTENT_TYPE,
                                "text/plain; version=0.0.4",
                            )],
                            body,
                        )
                    }
                }),
            );
            async move {
                axum::serve(listener, app).await.expect("serve metrics");
            }
        });

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        server.abort();

        assert!(
            body.contains("tailbridge_reconcile_total{result=\"converged\"")
                || body.contains("tailbridge_reconcile_total"),
            "metrics payload missing reconcile counter: {body}"
        );
    }

    #[test]
    fn bridge_metrics_emit_expected_series() {
        let handle = init_metrics_recorder();

        record_cli_call("serve", "ok");
        record_service_apply("create", "ok");
        record_lifecycle_event("start");
        record_event_stream_restart();
        record_reconcile_duration("applied", Duration::from_millis(5));
        record_managed_services(2);

        let rendered = handle.render();
        assert!(
            rendered.contains("tailbridge_cli_calls_total"),
            "cli call counter missing: {rendered}"
        );
        assert!(
            rendered.contains("tailbridge_service_applies_total"),
            "service apply counter missing: {rendered}"
        );
        assert!(
            rendered.contains("tailbridge_lifecycle_events_total{action=\"start\"")
                || rendered.contains("tailbridge_lifecycle_events_total"),
            "lifecycle counter missing: {rendered}"
        );
        assert!(
            rendered.contains("tailbridge_event_stream_restarts_total"),
            "event stream restart counter missing: {rendered}"
        );
        assert!(
            rendered.contains("tailbridge_reconcile_duration_ms"),
            "reconcile duration histogram missing: {rendered}"
        );
        assert!(
            rendered.contains("tailbridge_managed_services"),
            "managed services gauge missing: {rendered}"
        );
    }
}
