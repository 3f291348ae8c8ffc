// Backlog node entry point.
use anyhow::Result;
use backlog::{config, observability};
use backlog_cache::BroadcasterCache;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("backlog-node")?;

    let config = config::NodeConfig::from_env_or_yaml()?;
    let options = config.cache_options();
    tracing::info!(
        shared_scheduler = options.shared_scheduler,
        client_idle_timeout = ?options.client_idle_timeout,
        sweep_interval = ?options.sweep_interval,
        "cache configuration loaded"
    );

    // Sweeps share this runtime unless the config asks for a dedicated one.
    let cache = Arc::new(
        BroadcasterCache::new().with_shared_runtime(tokio::runtime::Handle::current()),
    );
    cache.configure(options)?;
    cache.start()?;
    tracing::info!("backlog cache started");

    let metrics_task = {
        let cache = Arc::clone(&cache);
        let addr = config.metrics_bind;
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, cache, addr).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    metrics_task.abort();
    cache.stop()?;
    tracing::info!("backlog cache stopped");
    Ok(())
}
