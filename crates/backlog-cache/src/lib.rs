// Per-subscriber message cache for a pub/sub broadcaster.
// Messages published while a subscriber is detached are buffered under its
// stable identity until it polls again or goes idle long enough to be swept.
pub mod cache;
pub mod chain;
pub mod envelope;
pub mod liveness;
pub mod scheduler;
pub mod store;
pub mod sweeper;

pub use cache::{BroadcasterCache, CacheStats, Phase};
pub use chain::{CacheInspector, CacheListener, ObserverError};
pub use envelope::{BroadcastMessage, CachedMessage, Recipient};
pub use scheduler::SweepScheduler;
pub use sweeper::SweepReport;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error(transparent)]
    Config(#[from] backlog_common::Error),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}
