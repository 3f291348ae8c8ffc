// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so message ids never mix with other uuids.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID; collisions are negligible.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(MessageId);
}

pub const DEFAULT_SHARED_SCHEDULER: bool = true;
pub const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const SHARED_KEYS: &[&str] = &["shared"];
const IDLE_TIMEOUT_KEYS: &[&str] = &["client_idle_timeout_secs", "uuid_cache_client_idle_time"];
const SWEEP_INTERVAL_KEYS: &[&str] = &["sweep_interval_secs", "uuid_cache_idle_cache_interval"];

/// Options read by the cache's configuration step.
///
/// ```
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use backlog_common::CacheOptions;
///
/// let mut props = HashMap::new();
/// props.insert("client_idle_timeout_secs".to_string(), "5".to_string());
/// let options = CacheOptions::from_properties(&props).expect("options");
/// assert_eq!(options.client_idle_timeout, Duration::from_secs(5));
/// assert_eq!(options.sweep_interval, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    // Run sweeps on a runtime shared with the owner instead of a dedicated one.
    pub shared_scheduler: bool,
    // Subscribers idle for longer than this are evicted on the next sweep.
    pub client_idle_timeout: Duration,
    // Delay between two sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shared_scheduler: DEFAULT_SHARED_SCHEDULER,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheOptions {
    pub fn with_shared_scheduler(mut self, shared: bool) -> Self {
        self.shared_scheduler = shared;
        self
    }

    pub fn with_client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.client_idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build options from string properties, keeping defaults for absent keys.
    ///
    /// Values that are present but malformed are rejected rather than ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some((key, value)) = lookup(props, SHARED_KEYS) {
            options.shared_scheduler = parse_bool(key, value)?;
        }
        if let Some((key, value)) = lookup(props, IDLE_TIMEOUT_KEYS) {
            options.client_idle_timeout = parse_secs(key, value)?;
        }
        if let Some((key, value)) = lookup(props, SWEEP_INTERVAL_KEYS) {
            options.sweep_interval = parse_secs(key, value)?;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        // A zero period would make the sweeper spin.
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be greater than zero".into()));
        }
        Ok(())
    }
}

fn lookup<'a>(
    props: &'a HashMap<String, String>,
    keys: &[&'static str],
) -> Option<(&'static str, &'a str)> {
    keys.iter()
        .find_map(|key| props.get(*key).map(|value| (*key, value.as_str())))
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

pub fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("{key}: expected whole seconds, got {value:?}")))
}
