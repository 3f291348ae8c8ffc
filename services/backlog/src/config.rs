use anyhow::{Context, Result};
use backlog_common::{CacheOptions, parse_bool, parse_secs};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Node configuration sourced from environment variables, optionally overridden by YAML.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Metrics/introspection HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Run sweeps on the node's runtime instead of a dedicated one.
    pub shared_scheduler: bool,
    // Idle time after which a subscriber is evicted.
    pub client_idle_timeout_secs: u64,
    // Delay between eviction sweeps.
    pub sweep_interval_secs: u64,
}

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Deserialize)]
struct NodeConfigOverride {
    metrics_bind: Option<String>,
    shared_scheduler: Option<bool>,
    client_idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = CacheOptions::default();
        let metrics_bind = std::env::var("BACKLOG_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse BACKLOG_METRICS_BIND")?;
        let shared_scheduler = match std::env::var("BACKLOG_SHARED_SCHEDULER") {
            Ok(value) => parse_bool("BACKLOG_SHARED_SCHEDULER", &value)?,
            Err(_) => defaults.shared_scheduler,
        };
        let client_idle_timeout_secs = match std::env::var("BACKLOG_CLIENT_IDLE_TIMEOUT_SECS") {
            Ok(value) => parse_secs("BACKLOG_CLIENT_IDLE_TIMEOUT_SECS", &value)?.as_secs(),
            Err(_) => defaults.client_idle_timeout.as_secs(),
        };
        let sweep_interval_secs = match std::env::var("BACKLOG_SWEEP_INTERVAL_SECS") {
            Ok(value) => parse_secs("BACKLOG_SWEEP_INTERVAL_SECS", &value)?.as_secs(),
            Err(_) => defaults.sweep_interval.as_secs(),
        };
        Ok(Self {
            metrics_bind,
            shared_scheduler,
            client_idle_timeout_secs,
            sweep_interval_secs,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("BACKLOG_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read BACKLOG_CONFIG: {path}"))?;
            let override_cfg: NodeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse node config yaml")?;
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.shared_scheduler {
                config.shared_scheduler = value;
            }
            if let Some(value) = override_cfg.client_idle_timeout_secs {
                config.client_idle_timeout_secs = value;
            }
            if let Some(value) = override_cfg.sweep_interval_secs {
                config.sweep_interval_secs = value;
            }
        }
        Ok(config)
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions::default()
            .with_shared_scheduler(self.shared_scheduler)
            .with_client_idle_timeout(Duration::from_secs(self.client_idle_timeout_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}
