use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// One scheduler of named recurring jobs replaces per-component polling
/// loops. A failed tick is logged and the job keeps running; jobs only stop
/// when cancelled or at shutdown.
pub struct Scheduler {
    jobs: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a recurring job. A job already registered under the same
    /// name is cancelled and replaced.
    pub async fn register<F, Fut>(&self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh job waits
            // one full period before its first run.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = job().await {
                    warn!("job {} tick failed: {}", job_name, e);
                } else {
                    debug!("job {} tick ok", job_name);
                }
            }
        });

        if let Some(old) = self.jobs.write().await.insert(name.to_string(), handle) {
            old.abort();
        }
        info!("job {} registered ({}s period)", name, period.as_secs_f64());
    }

    /// Cancel a job by name. Returns whether it existed.
    pub async fn cancel(&self, name: &str) -> bool {
        if let Some(handle) = self.jobs.write().await.remove(name) {
            handle.abort();
            info!("job {} cancelled", name);
            true
        } else {
            false
        }
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// Abort every job. The scheduler can be reused afterwards.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.write().await;
        for (name, handle) in jobs.drain() {
            handle.abort();
            debug!("job {} aborted", name);
        }
        info!("scheduler shut down");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::coord_error::CoordError;

    #[tokio::test]
    async fn test_failing_tick_does_not_stop_job() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = ticks.clone();
        scheduler
            .register("flaky", Duration::from_millis(10), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CoordError::InvalidState("boom".into()).into())
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_replaces_and_cancel() {
        let scheduler = Scheduler::new();
        scheduler
            .register("sweep", Duration::from_secs(60), || async { Ok(()) })
            .await;
        scheduler
            .register("sweep", Duration::from_secs(60), || async { Ok(()) })
            .await;
        assert_eq!(scheduler.job_names().await.len(), 1);

        assert!(scheduler.cancel("sweep").await);
        assert!(!scheduler.cancel("sweep").await);
    }
}
