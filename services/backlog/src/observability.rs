//! Tracing, metrics and the introspection HTTP surface for a backlog node.
//!
//! A Prometheus recorder is installed globally so the counters emitted by
//! `backlog-cache` are rendered on `/metrics`. The same listener answers the
//! `/live` and `/ready` probes and serves a JSON snapshot of the cache on `/cache`.
//! Initialization is idempotent: the recorder is installed once per process and an
//! already-installed global subscriber is kept.

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use backlog_cache::{BroadcasterCache, CacheStats, Phase};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and metrics for the service.
///
/// Log filtering follows `RUST_LOG`, defaulting to `info`. Returns the handle used
/// to render the Prometheus exposition.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

#[derive(Clone)]
struct AppState {
    metrics: PrometheusHandle,
    cache: Arc<BroadcasterCache>,
}

/// Builds the introspection router.
///
/// - `/metrics`: Prometheus exposition.
/// - `/live`: always "ok" while the process serves requests.
/// - `/ready`: "ok" once the cache is running, 503 otherwise.
/// - `/cache`: JSON [`CacheStats`] snapshot.
pub fn router(metrics: PrometheusHandle, cache: Arc<BroadcasterCache>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .route("/cache", get(cache_stats))
        .with_state(AppState { metrics, cache })
}

/// Serves the introspection router on `addr` until the listener fails.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    cache: Arc<BroadcasterCache>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, router(handle, cache).into_make_service()).await
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.cache.phase() {
        Phase::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

// Repeated calls within one process reuse the first recorder.
fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    let _ = METRICS_HANDLE.set(handle.clone());
    Ok(handle)
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if subscriber.try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use backlog_cache::{BroadcastMessage, Recipient};
    use backlog_common::CacheOptions;
    use serial_test::serial;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> Result<(StatusCode, String)> {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty())?)
            .await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, String::from_utf8(body.to_vec())?))
    }

    fn running_cache() -> Result<Arc<BroadcasterCache>> {
        let cache =
            BroadcasterCache::new().with_shared_runtime(tokio::runtime::Handle::current());
        cache.configure(CacheOptions::default())?;
        cache.start()?;
        Ok(Arc::new(cache))
    }

    #[test]
    #[serial]
    fn init_observability_succeeds() -> Result<()> {
        let handle = init_observability("test-service")?;
        let _ = handle.render();
        Ok(())
    }

    #[test]
    #[serial]
    fn install_metrics_recorder_is_cached() -> Result<()> {
        let first = install_metrics_recorder()?;
        let second = install_metrics_recorder()?;
        let _ = first.render();
        let _ = second.render();
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn probes_follow_the_cache_lifecycle() -> Result<()> {
        let handle = init_observability("test-probes")?;
        let cache = Arc::new(
            BroadcasterCache::new().with_shared_runtime(tokio::runtime::Handle::current()),
        );
        let app = router(handle, Arc::clone(&cache));

        let (status, body) = get_path(app.clone(), "/live").await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, _) = get_path(app.clone(), "/ready").await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        cache.configure(CacheOptions::default())?;
        cache.start()?;
        let (status, body) = get_path(app.clone(), "/ready").await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        cache.stop()?;
        let (status, _) = get_path(app, "/ready").await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn cache_endpoint_reports_stats() -> Result<()> {
        let handle = init_observability("test-cache-stats")?;
        let cache = running_cache()?;
        cache.cache_candidate("chat", "a");
        cache.cache_candidate("chat", "b");
        cache.add_to_cache("chat", Recipient::All, BroadcastMessage::new("hello"));

        let (status, body) = get_path(router(handle, Arc::clone(&cache)), "/cache").await?;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_str(&body)?;
        assert_eq!(stats["phase"], "running");
        assert_eq!(stats["subscribers"], 2);
        assert_eq!(stats["queued_messages"], 2);
        cache.stop()?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn metrics_endpoint_renders_cache_counters() -> Result<()> {
        let handle = init_observability("test-metrics")?;
        let cache = running_cache()?;
        cache.cache_candidate("chat", "a");
        cache.add_to_cache("chat", Recipient::subscriber("a"), BroadcastMessage::new("m1"));

        let (status, body) = get_path(router(handle, Arc::clone(&cache)), "/metrics").await?;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("backlog_cache_admitted_total"));
        cache.stop()?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn serve_metrics_binds_and_answers() -> Result<()> {
        let handle = init_observability("test-serve")?;
        let cache = running_cache()?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let server = tokio::spawn(serve_metrics(handle, Arc::clone(&cache), addr));
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(_) => break,
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    return Err(anyhow::anyhow!("server not ready at {addr}: {err}"));
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        server.abort();
        cache.stop()?;
        Ok(())
    }
}
