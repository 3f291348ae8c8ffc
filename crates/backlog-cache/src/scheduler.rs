// Runtime the periodic sweep is scheduled on.
use crate::{CacheError, Result};
use tokio::runtime::{Builder, Handle, Runtime};

const DEDICATED_THREAD_NAME: &str = "backlog-sweeper";

/// Where sweeps run.
///
/// A shared scheduler borrows a runtime owned by someone else and is never shut
/// down by the cache. A dedicated one is created by the cache and released
/// when the cache stops.
#[derive(Debug)]
pub enum SweepScheduler {
    Shared(Handle),
    Dedicated(Runtime),
}

impl SweepScheduler {
    pub fn shared(handle: Handle) -> Self {
        SweepScheduler::Shared(handle)
    }

    pub fn dedicated() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(DEDICATED_THREAD_NAME)
            .enable_time()
            .build()
            .map_err(|err| CacheError::Scheduler(err.to_string()))?;
        Ok(SweepScheduler::Dedicated(runtime))
    }

    /// Pick a scheduler for the given preference.
    ///
    /// A shared scheduler uses `injected` if present, then the ambient runtime;
    /// with neither available a dedicated runtime is created instead.
    pub fn select(shared: bool, injected: Option<&Handle>) -> Result<Self> {
        if shared {
            if let Some(handle) = injected {
                return Ok(SweepScheduler::Shared(handle.clone()));
            }
            if let Ok(handle) = Handle::try_current() {
                return Ok(SweepScheduler::Shared(handle));
            }
            tracing::debug!("no runtime to share; creating a dedicated sweep scheduler");
        }
        Self::dedicated()
    }

    pub fn handle(&self) -> Handle {
        match self {
            SweepScheduler::Shared(handle) => handle.clone(),
            SweepScheduler::Dedicated(runtime) => runtime.handle().clone(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, SweepScheduler::Shared(_))
    }

    /// Release the scheduler; only a dedicated runtime is shut down.
    pub fn release(self) {
        if let SweepScheduler::Dedicated(runtime) = self {
            // Must not block: release may run inside another runtime.
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_without_runtime_falls_back_to_dedicated() {
        let scheduler = SweepScheduler::select(true, None).expect("scheduler");
        assert!(!scheduler.is_shared());
        scheduler.release();
    }

    #[tokio::test]
    async fn shared_uses_ambient_runtime() {
        let scheduler = SweepScheduler::select(true, None).expect("scheduler");
        assert!(scheduler.is_shared());
        scheduler.release();
    }

    #[tokio::test]
    async fn dedicated_runs_tasks_and_releases_inside_a_runtime() {
        let scheduler = SweepScheduler::select(false, None).expect("scheduler");
        assert!(!scheduler.is_shared());
        let value = scheduler.handle().spawn(async { 7 }).await.expect("join");
        assert_eq!(value, 7);
        scheduler.release();
    }

    #[test]
    fn injected_handle_is_preferred() {
        let runtime = Builder::new_current_thread().build().expect("runtime");
        let scheduler =
            SweepScheduler::select(true, Some(runtime.handle())).expect("scheduler");
        assert!(scheduler.is_shared());
        scheduler.release();
    }
}
